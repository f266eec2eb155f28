//! Deterministic, filesystem-safe storage paths for attachment files.
//!
//! File and directory names must survive Windows path rules (invalid
//! characters, reserved device names, MAX_PATH) while staying stable
//! across runs so re-downloads land on the same path.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Upper bound for a generated attachment filename.
const MAX_FILENAME_LEN: usize = 120;

/// Names Windows reserves for devices regardless of extension.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

fn is_invalid_path_char(c: char) -> bool {
    c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
}

fn short_hash(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(len);
    for byte in digest {
        if hex.len() >= len {
            break;
        }
        hex.push_str(&format!("{:02x}", byte));
    }
    hex.truncate(len);
    hex
}

/// Rewrite a path component so it is safe on every platform: invalid
/// characters become underscores, leading/trailing dots and spaces are
/// stripped, and reserved device names are prefixed.
pub fn sanitize_component(value: Option<&str>, fallback: &str) -> String {
    let raw = value.map(str::trim).unwrap_or("");
    let raw = if raw.is_empty() { fallback } else { raw };

    let cleaned: String = raw
        .chars()
        .map(|c| if is_invalid_path_char(c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_matches(|c| c == '.' || c == ' ');
    let cleaned = if cleaned.is_empty() { fallback } else { cleaned };

    if RESERVED_NAMES.contains(&cleaned.to_uppercase().as_str()) {
        return format!("_{}", cleaned);
    }
    cleaned.to_string()
}

/// Directory for one message's attachment files. Compact and deterministic
/// (numeric primary key plus a short hash of the remote id) to stay well
/// under path-length limits.
pub fn message_dir(
    output_root: &Path,
    mailbox_key: &str,
    message_id: i64,
    remote_message_id: &str,
) -> PathBuf {
    let mailbox_component = sanitize_component(Some(mailbox_key), "mailbox");
    let msg_hash = short_hash(remote_message_id, 12);
    output_root
        .join(mailbox_component)
        .join(format!("m{}_{}", message_id, msg_hash))
}

/// Collision-resistant filename for an attachment: sanitized original name,
/// a short hash of the remote attachment id, and the (bounded) original
/// extension, capped at 120 characters total.
pub fn attachment_filename(original_name: Option<&str>, attachment_id: &str) -> String {
    let safe_name = sanitize_component(original_name, "attachment.bin");

    let (root, ext) = match safe_name.rfind('.') {
        Some(idx) if idx > 0 => safe_name.split_at(idx),
        _ => (safe_name.as_str(), ""),
    };
    let ext: String = ext.chars().take(12).collect();

    let suffix = format!("_{}", short_hash(attachment_id, 8));
    let max_root_len = MAX_FILENAME_LEN
        .saturating_sub(ext.len() + suffix.len())
        .max(8);

    let root = if root.is_empty() { "attachment" } else { root };
    let compact_root: String = root.chars().take(max_root_len).collect();
    let compact_root = compact_root.trim_end_matches(|c| c == '.' || c == ' ');
    let compact_root = if compact_root.is_empty() {
        "attachment"
    } else {
        compact_root
    };

    format!("{}{}{}", compact_root, suffix, ext)
}

/// Decode an inline attachment payload.
///
/// Strict base64 first; payloads with embedded whitespace or other stray
/// characters get a forgiving second pass that drops everything outside
/// the base64 alphabet.
pub fn decode_content_bytes(content: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if content.is_empty() {
        return Ok(Vec::new());
    }

    match BASE64.decode(content) {
        Ok(bytes) => Ok(bytes),
        Err(_) => {
            let filtered: String = content
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
                .collect();
            BASE64.decode(filtered)
        }
    }
}

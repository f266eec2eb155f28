//! Wire payload shapes returned by the remote mail API.
//!
//! Listing endpoints return loosely-typed JSON; these structs pull out the
//! fields the pipelines persist and tolerate everything else being absent.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderPayload {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub total_item_count: i32,
    #[serde(default)]
    pub child_folder_count: i32,
}

impl FolderPayload {
    pub fn display_name_or(&self, fallback: &str) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAddress {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromField {
    #[serde(default)]
    pub email_address: Option<EmailAddress>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Option<FromField>,
    #[serde(default)]
    pub received_date_time: Option<String>,
    #[serde(default)]
    pub body_preview: Option<String>,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub parent_folder_id: Option<String>,
}

impl MessagePayload {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn sender_address(&self) -> Option<&str> {
        self.from
            .as_ref()
            .and_then(|f| f.email_address.as_ref())
            .and_then(|a| a.address.as_deref())
    }

    /// Received timestamp, leniently parsed; malformed values become `None`
    /// rather than failing the message.
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        parse_remote_timestamp(self.received_date_time.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
    /// Inline base64 payload; absent for linked/oversized attachments.
    #[serde(default)]
    pub content_bytes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_ttl")]
    pub expires_in: i64,
}

fn default_token_ttl() -> i64 {
    3600
}

pub fn parse_remote_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_payload_extracts_sender_and_timestamp() {
        let value = json!({
            "id": "AAMkAD1",
            "subject": "PO 4411 confirmation",
            "from": {"emailAddress": {"name": "Acme", "address": "sales@acme.example"}},
            "receivedDateTime": "2024-03-05T16:20:00Z",
            "bodyPreview": "Please find attached",
            "hasAttachments": true,
            "conversationId": "conv-1",
            "parentFolderId": "folder-1"
        });

        let payload = MessagePayload::from_value(&value).unwrap();
        assert_eq!(payload.sender_address(), Some("sales@acme.example"));
        assert!(payload.has_attachments);
        let received = payload.received_at().unwrap();
        assert_eq!(received.to_rfc3339(), "2024-03-05T16:20:00+00:00");
    }

    #[test]
    fn message_payload_tolerates_missing_fields() {
        let payload = MessagePayload::from_value(&json!({"id": "AAMkAD2"})).unwrap();
        assert_eq!(payload.sender_address(), None);
        assert_eq!(payload.received_at(), None);
        assert!(!payload.has_attachments);
    }

    #[test]
    fn message_payload_without_id_is_rejected() {
        assert!(MessagePayload::from_value(&json!({"subject": "no id"})).is_err());
    }

    #[test]
    fn malformed_timestamp_becomes_none() {
        assert_eq!(parse_remote_timestamp(Some("not-a-date")), None);
        assert_eq!(parse_remote_timestamp(Some("")), None);
        assert!(parse_remote_timestamp(Some("2024-01-02T03:04:05Z")).is_some());
    }
}

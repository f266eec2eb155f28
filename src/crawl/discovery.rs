//! Folder discovery: materialize the mailbox folder hierarchy as a flat,
//! root-first list under one of two traversal strategies.

use crate::config::{MailboxConfig, TraversalMode};
use crate::error::SyncError;
use crate::graph::{GraphClient, page_values};
use crate::models::FolderPayload;
use regex::Regex;
use std::collections::VecDeque;

/// One discovered folder, root first in the output ordering.
#[derive(Debug, Clone)]
pub struct FolderRecord {
    pub remote_id: String,
    pub path_parts: Vec<String>,
    pub display_name: String,
    pub parent_remote_id: Option<String>,
    pub total_item_count: i32,
}

impl FolderRecord {
    pub fn path(&self) -> String {
        self.path_parts.join("/")
    }
}

/// Traversal strategy, derived from the mailbox configuration. Callers
/// stay traversal-mode-agnostic: both variants expose the same
/// [`Traversal::discover`] contract.
#[derive(Debug)]
pub enum Traversal {
    Recursive {
        max_depth: Option<u32>,
    },
    TargetedTwoLevel {
        location_filters: Vec<String>,
        job_folder_pattern: Regex,
    },
}

impl Traversal {
    pub fn from_config(mailbox: &MailboxConfig) -> Result<Self, SyncError> {
        match mailbox.traversal_mode {
            TraversalMode::Recursive => Ok(Traversal::Recursive {
                max_depth: mailbox.max_folder_depth,
            }),
            TraversalMode::TargetedTwoLevel => {
                let pattern = Regex::new(&mailbox.job_folder_pattern).map_err(|e| {
                    SyncError::Config(crate::config::ConfigError(format!(
                        "invalid job folder pattern {:?}: {}",
                        mailbox.job_folder_pattern, e
                    )))
                })?;
                Ok(Traversal::TargetedTwoLevel {
                    location_filters: mailbox.location_filters.clone(),
                    job_folder_pattern: pattern,
                })
            }
        }
    }

    /// Enumerate the mailbox's folders, root first.
    pub async fn discover(
        &self,
        client: &GraphClient,
        mailbox: &MailboxConfig,
    ) -> Result<Vec<FolderRecord>, SyncError> {
        match self {
            Traversal::Recursive { max_depth } => {
                discover_recursive(client, mailbox, *max_depth).await
            }
            Traversal::TargetedTwoLevel {
                location_filters,
                job_folder_pattern,
            } => {
                discover_targeted(client, mailbox, location_filters, job_folder_pattern).await
            }
        }
    }
}

async fn fetch_root(
    client: &GraphClient,
    mailbox: &MailboxConfig,
) -> Result<FolderRecord, SyncError> {
    let path = format!(
        "/users/{}/mailFolders/{}",
        mailbox.user_id, mailbox.root_folder_id
    );
    let value = client.get_json(&path, &[]).await?;
    let payload: FolderPayload =
        serde_json::from_value(value).map_err(crate::graph::GraphError::Decode)?;
    let display_name = payload.display_name_or(&mailbox.root_folder_id);

    Ok(FolderRecord {
        remote_id: payload.id,
        path_parts: vec![display_name.clone()],
        display_name,
        parent_remote_id: None,
        total_item_count: payload.total_item_count,
    })
}

fn child_folders_path(user_id: &str, folder_id: &str) -> String {
    format!("/users/{}/mailFolders/{}/childFolders", user_id, folder_id)
}

/// Full walk from the root, breadth-first, optionally depth-limited.
/// Child listings are paginated per level.
async fn discover_recursive(
    client: &GraphClient,
    mailbox: &MailboxConfig,
    max_depth: Option<u32>,
) -> Result<Vec<FolderRecord>, SyncError> {
    let root = fetch_root(client, mailbox).await?;
    let mut out = vec![root.clone()];

    let mut queue = VecDeque::new();
    queue.push_back((root.remote_id.clone(), root.path_parts.clone(), 1u32));

    while let Some((folder_id, path_parts, depth)) = queue.pop_front() {
        if let Some(limit) = max_depth {
            if depth >= limit {
                continue;
            }
        }

        let path = child_folders_path(&mailbox.user_id, &folder_id);
        let mut pager = client.paged(&path, &[]);
        while let Some(page) = pager.next_page().await? {
            for item in page_values(&page) {
                let child: FolderPayload = serde_json::from_value(item.clone())
                    .map_err(crate::graph::GraphError::Decode)?;
                let display_name = child.display_name_or("");
                let mut child_path = path_parts.clone();
                child_path.push(display_name.clone());

                out.push(FolderRecord {
                    remote_id: child.id.clone(),
                    path_parts: child_path.clone(),
                    display_name,
                    parent_remote_id: Some(folder_id.clone()),
                    total_item_count: child.total_item_count,
                });
                queue.push_back((child.id, child_path, depth + 1));
            }
        }
    }

    Ok(out)
}

/// Two fixed levels under the root: location folders filtered by substring
/// tokens, then job folders filtered by the job-folder pattern. Folders
/// failing either filter are not descended into or retained.
async fn discover_targeted(
    client: &GraphClient,
    mailbox: &MailboxConfig,
    location_filters: &[String],
    job_folder_pattern: &Regex,
) -> Result<Vec<FolderRecord>, SyncError> {
    let root = fetch_root(client, mailbox).await?;
    let root_name = root.display_name.clone();
    let root_id = root.remote_id.clone();
    let mut out = vec![root];

    let location_path = child_folders_path(&mailbox.user_id, &root_id);
    let mut location_pager = client.paged(&location_path, &[]);
    while let Some(location_page) = location_pager.next_page().await? {
        for location_item in page_values(&location_page) {
            let location: FolderPayload = serde_json::from_value(location_item.clone())
                .map_err(crate::graph::GraphError::Decode)?;
            let location_name = location.display_name_or("");
            if !matches_location(&location_name, location_filters) {
                continue;
            }

            out.push(FolderRecord {
                remote_id: location.id.clone(),
                path_parts: vec![root_name.clone(), location_name.clone()],
                display_name: location_name.clone(),
                parent_remote_id: Some(root_id.clone()),
                total_item_count: location.total_item_count,
            });

            let job_path = child_folders_path(&mailbox.user_id, &location.id);
            let mut job_pager = client.paged(&job_path, &[]);
            while let Some(job_page) = job_pager.next_page().await? {
                for job_item in page_values(&job_page) {
                    let job: FolderPayload = serde_json::from_value(job_item.clone())
                        .map_err(crate::graph::GraphError::Decode)?;
                    let job_name = job.display_name_or("");
                    if !job_folder_pattern.is_match(&job_name) {
                        continue;
                    }

                    out.push(FolderRecord {
                        remote_id: job.id.clone(),
                        path_parts: vec![
                            root_name.clone(),
                            location_name.clone(),
                            job_name.clone(),
                        ],
                        display_name: job_name,
                        parent_remote_id: Some(location.id.clone()),
                        total_item_count: job.total_item_count,
                    });
                }
            }
        }
    }

    Ok(out)
}

/// Empty filter list retains every location; otherwise any token must
/// appear as a case-insensitive substring.
fn matches_location(name: &str, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }
    let lowered = name.to_lowercase();
    filters
        .iter()
        .any(|token| lowered.contains(&token.to_lowercase()))
}

/// Include/exclude path filtering for ingestion targets: every include
/// token must appear as a case-insensitive substring of the joined path,
/// and no exclude token may appear.
pub fn path_matches(path_parts: &[String], include: &[String], exclude: &[String]) -> bool {
    let path = path_parts.join("/").to_lowercase();
    if !include.is_empty()
        && !include
            .iter()
            .all(|token| path.contains(&token.to_lowercase()))
    {
        return false;
    }
    if exclude
        .iter()
        .any(|token| path.contains(&token.to_lowercase()))
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn include_and_exclude_filters_apply_case_insensitively() {
        let include = parts(&["finance"]);
        let exclude = parts(&["invoices"]);

        assert!(!path_matches(
            &parts(&["root", "Finance", "Invoices"]),
            &include,
            &exclude
        ));
        assert!(path_matches(
            &parts(&["root", "Finance", "POs"]),
            &include,
            &exclude
        ));
    }

    #[test]
    fn empty_filters_match_everything() {
        assert!(path_matches(&parts(&["anything", "at", "all"]), &[], &[]));
    }

    #[test]
    fn all_include_tokens_must_be_present() {
        let include = parts(&["finance", "2024"]);
        assert!(path_matches(
            &parts(&["root", "Finance", "2024 Jobs"]),
            &include,
            &[]
        ));
        assert!(!path_matches(&parts(&["root", "Finance"]), &include, &[]));
    }

    #[test]
    fn location_filter_is_substring_based() {
        let filters = parts(&["carolina", "richmond"]);
        assert!(matches_location("North Carolina", &filters));
        assert!(matches_location("Richmond Office", &filters));
        assert!(!matches_location("Nova", &filters));
        assert!(matches_location("Nova", &[]));
    }

    #[test]
    fn traversal_from_config_rejects_bad_pattern() {
        let mut config = MailboxConfig::for_user("jobs@example.com", "root");
        config.traversal_mode = TraversalMode::TargetedTwoLevel;
        config.job_folder_pattern = "[".to_string();
        assert!(Traversal::from_config(&config).is_err());
    }
}

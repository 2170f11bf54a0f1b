use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Account snapshot reported by the about endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AboutSnapshot {
    pub largest_change_id: i64,
    pub quota_bytes_total: i64,
    pub quota_bytes_used: i64,
    pub root_folder_id: String,
}

/// A single server-reported change to one resource.
///
/// Entries are never mutated once produced. A later entry with the same `id`
/// and a higher `change_stamp` supersedes an earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub id: String,
    pub change_stamp: i64,
    pub deleted: bool,
    pub parent_ids: BTreeSet<String>,
    pub title: String,
    pub is_directory: bool,
    pub content_hash: Option<String>,
    /// Unix timestamp, seconds.
    pub modified: Option<i64>,
}

impl ChangeEntry {
    pub fn file(id: &str, parent_id: &str, title: &str, change_stamp: i64) -> Self {
        Self {
            id: id.to_string(),
            change_stamp,
            deleted: false,
            parent_ids: BTreeSet::from([parent_id.to_string()]),
            title: title.to_string(),
            is_directory: false,
            content_hash: None,
            modified: None,
        }
    }

    pub fn directory(id: &str, parent_id: &str, title: &str, change_stamp: i64) -> Self {
        Self {
            is_directory: true,
            ..Self::file(id, parent_id, title, change_stamp)
        }
    }

    pub fn deletion(id: &str, change_stamp: i64) -> Self {
        Self {
            id: id.to_string(),
            change_stamp,
            deleted: true,
            parent_ids: BTreeSet::new(),
            title: String::new(),
            is_directory: false,
            content_hash: None,
            modified: None,
        }
    }
}

/// One page of a paginated change or directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeListPage {
    pub entries: Vec<ChangeEntry>,
    pub next_page_token: Option<String>,
}

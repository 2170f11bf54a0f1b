use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use drive_core::ChangeEntry;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("entry not found: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
}

/// Stable identifier of an entry in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub i64);

impl LocalId {
    pub const ROOT: LocalId = LocalId(1);
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub local_id: LocalId,
    pub resource_id: Option<String>,
    pub parent_resource_id: Option<String>,
    pub title: String,
    pub is_directory: bool,
    pub content_hash: Option<String>,
    pub modified: Option<i64>,
    pub change_stamp: i64,
    /// Remote change stamp the directory's children were last fetched at.
    pub directory_changestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
    pub local_id: LocalId,
    pub resource_id: Option<String>,
    pub title: String,
    pub is_directory: bool,
    pub content_hash: Option<String>,
    pub modified: Option<i64>,
}

impl From<EntryRecord> for EntrySummary {
    fn from(record: EntryRecord) -> Self {
        Self {
            local_id: record.local_id,
            resource_id: record.resource_id,
            title: record.title,
            is_directory: record.is_directory,
            content_hash: record.content_hash,
            modified: record.modified,
        }
    }
}

/// Paths of local directories whose children changed during an apply.
pub type AffectedDirectories = BTreeSet<String>;

/// Local tree of drive entries.
///
/// Writers of server-sourced entries must go through the
/// [`LoaderController`](super::loader_controller::LoaderController) gate.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_local_id_by_path(&self, path: &str) -> Result<LocalId, MetadataError>;

    async fn get_entry(&self, local_id: LocalId) -> Result<Option<EntryRecord>, MetadataError>;

    /// Path of an entry, or `None` when it is not reachable from the root.
    async fn get_path(&self, local_id: LocalId) -> Result<Option<String>, MetadataError>;

    async fn get_largest_local_change_stamp(&self) -> Result<i64, MetadataError>;

    async fn set_root_resource_id(&self, resource_id: &str) -> Result<(), MetadataError>;

    /// Applies a change list as one transaction and records
    /// `largest_change_stamp` as the new local stamp.
    ///
    /// Entries are superseded by change stamp, so applying the same batch
    /// twice leaves the store as applying it once.
    async fn apply_change_entries(
        &self,
        entries: &[ChangeEntry],
        is_full_resync: bool,
        largest_change_stamp: i64,
    ) -> Result<AffectedDirectories, MetadataError>;

    /// Replaces the known children of `directory` with a fresh listing and
    /// stamps the directory with `directory_changestamp`.
    async fn refresh_directory(
        &self,
        directory: LocalId,
        entries: &[ChangeEntry],
        directory_changestamp: i64,
    ) -> Result<AffectedDirectories, MetadataError>;

    async fn read_directory_children(
        &self,
        local_id: LocalId,
    ) -> Result<Vec<EntrySummary>, MetadataError>;

    async fn get_entry_by_path(&self, path: &str) -> Result<EntryRecord, MetadataError> {
        let local_id = self.get_local_id_by_path(path).await?;
        self.get_entry(local_id)
            .await?
            .ok_or_else(|| MetadataError::NotFound(path.to_string()))
    }
}

/// Splits a drive path into its components. `"/"` and `""` name the root.
pub fn path_components(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

pub fn normalize_path(path: &str) -> String {
    let components = path_components(path);
    if components.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", components.join("/"))
    }
}

/// Parent of a normalized path; `None` for the root.
pub fn parent_path(path: &str) -> Option<String> {
    let mut components = path_components(path);
    components.pop()?;
    Some(if components.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", components.join("/"))
    })
}

pub fn join_path(parent: &str, title: &str) -> String {
    if parent == "/" {
        format!("/{title}")
    } else {
        format!("{parent}/{title}")
    }
}

use std::sync::Arc;

use drive_core::{AboutSnapshot, ChangeEntry, DriveError, DriveService};
use thiserror::Error;
use tracing::debug;

use crate::sync::about_loader::AboutResourceLoader;
use crate::sync::change_list_loader::{ChangeListLoader, ChangeListLoaderObserver, LoadError};
use crate::sync::loader_controller::{LoaderController, Lock};
use crate::sync::metadata::{
    AffectedDirectories, EntryRecord, EntrySummary, MetadataError, MetadataStore, normalize_path,
    parent_path,
};

#[derive(Debug, Error)]
pub enum FileSystemError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("remote service error: {0}")]
    Service(Arc<DriveError>),
    #[error(transparent)]
    Load(LoadError),
    #[error(transparent)]
    Storage(MetadataError),
}

impl From<LoadError> for FileSystemError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::NotFound(path) => Self::NotFound(path),
            LoadError::NotADirectory(path) => Self::NotADirectory(path),
            LoadError::Service(err) => Self::Service(err),
            other => Self::Load(other),
        }
    }
}

impl From<MetadataError> for FileSystemError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(path) => Self::NotFound(path),
            MetadataError::NotADirectory(path) => Self::NotADirectory(path),
            other => Self::Storage(other),
        }
    }
}

impl From<Arc<DriveError>> for FileSystemError {
    fn from(err: Arc<DriveError>) -> Self {
        Self::Service(err)
    }
}

/// Path-based view of the drive backed by the local metadata store.
pub struct FileSystem {
    store: Arc<dyn MetadataStore>,
    about: Arc<AboutResourceLoader>,
    loader: ChangeListLoader,
    controller: LoaderController,
}

impl FileSystem {
    pub fn new(service: Arc<dyn DriveService>, store: Arc<dyn MetadataStore>) -> Self {
        let controller = LoaderController::new();
        let about = Arc::new(AboutResourceLoader::new(Arc::clone(&service)));
        let loader = ChangeListLoader::new(
            service,
            Arc::clone(&store),
            Arc::clone(&about),
            controller.clone(),
        );
        Self {
            store,
            about,
            loader,
            controller,
        }
    }

    /// Lists a directory, loading it from the server first if needed.
    pub async fn read_directory(&self, path: &str) -> Result<Vec<EntrySummary>, FileSystemError> {
        let path = normalize_path(path);
        self.loader.load_directory_if_needed(&path).await?;
        let local_id = self.store.get_local_id_by_path(&path).await?;
        match self.store.read_directory_children(local_id).await {
            Err(MetadataError::NotADirectory(_)) => Err(FileSystemError::NotADirectory(path)),
            result => Ok(result?),
        }
    }

    pub async fn get_entry_by_path(&self, path: &str) -> Result<EntryRecord, FileSystemError> {
        let path = normalize_path(path);
        let directory = parent_path(&path).unwrap_or_else(|| "/".to_string());
        self.loader.load_directory_if_needed(&directory).await?;
        Ok(self.store.get_entry_by_path(&path).await?)
    }

    /// Polls for remote changes. `None` when a load is already in flight.
    pub async fn check_for_updates(&self) -> Option<Result<(), FileSystemError>> {
        let result = self.loader.check_for_updates().await?;
        Some(result.map_err(FileSystemError::from))
    }

    pub async fn get_about_resource(&self) -> Result<AboutSnapshot, FileSystemError> {
        Ok(self.about.get_about_resource().await?)
    }

    pub async fn update_about_resource(&self) -> Result<AboutSnapshot, FileSystemError> {
        Ok(self.about.update_about_resource().await?)
    }

    /// Records entries learned from the server outside the change feed, such
    /// as the result of an upload. Waits for any change list apply to finish.
    pub async fn add_server_entries(
        &self,
        entries: Vec<ChangeEntry>,
    ) -> Result<AffectedDirectories, FileSystemError> {
        let _turn = self.controller.wait_for_turn().await;
        // Keep the recorded stamp: these entries say nothing about the
        // changes between it and theirs.
        let local_stamp = self.store.get_largest_local_change_stamp().await?;
        let affected = self
            .store
            .apply_change_entries(&entries, false, local_stamp)
            .await?;
        debug!(entries = entries.len(), "added server entries");
        Ok(affected)
    }

    /// Holds back change list applies until the returned lock is dropped.
    pub fn acquire_lock(&self) -> Lock {
        self.controller.acquire_lock()
    }

    pub fn is_refreshing(&self) -> bool {
        self.loader.is_refreshing()
    }

    pub fn is_loaded(&self) -> bool {
        self.loader.is_loaded()
    }

    pub fn add_observer(&self, observer: Arc<dyn ChangeListLoaderObserver>) {
        self.loader.add_observer(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ChangeListLoaderObserver>) {
        self.loader.remove_observer(observer);
    }
}

#[cfg(test)]
#[path = "file_system_tests.rs"]
mod tests;

//! Brings the local metadata store in line with the remote change feed.
//!
//! A load is identified by a [`LoadKey`]: the global key for a full or delta
//! change list load, or a directory key for fetching one directory's children
//! out of band. Requests for a key that is already in flight join it and get
//! the same outcome. Each load runs on its own task holding only a weak
//! reference to the loader state, so dropping the loader resolves any
//! outstanding requests with [`LoadError::Shutdown`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use drive_core::{ChangeEntry, DriveError, DriveService};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::about_loader::AboutResourceLoader;
use super::loader_controller::LoaderController;
use super::metadata::{
    AffectedDirectories, EntryRecord, LocalId, MetadataError, MetadataStore, normalize_path,
    parent_path,
};

#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("remote service error: {0}")]
    Service(Arc<DriveError>),
    #[error("metadata store error: {0}")]
    Storage(Arc<MetadataError>),
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("loader shut down before the load completed")]
    Shutdown,
}

impl From<DriveError> for LoadError {
    fn from(err: DriveError) -> Self {
        Self::Service(Arc::new(err))
    }
}

impl From<Arc<DriveError>> for LoadError {
    fn from(err: Arc<DriveError>) -> Self {
        Self::Service(err)
    }
}

impl From<MetadataError> for LoadError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(path) => Self::NotFound(path),
            MetadataError::NotADirectory(path) => Self::NotADirectory(path),
            other => Self::Storage(Arc::new(other)),
        }
    }
}

pub type LoadResult = Result<(), LoadError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LoadKey {
    Global,
    Directory(LocalId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadScope {
    ChangeList,
    Directory(String),
}

/// Directory to fetch ahead of the change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryFetchInfo {
    pub local_id: LocalId,
    pub path: String,
    /// Remote stamp the directory's children were last fetched at.
    pub changestamp: i64,
}

/// Notifications about applied changes. Called on the loading task.
pub trait ChangeListLoaderObserver: Send + Sync {
    fn on_directory_changed(&self, _path: &str) {}

    fn on_load_completed(&self, _scope: &LoadScope) {}

    fn on_initial_load_complete(&self) {}
}

type Waiter = oneshot::Sender<LoadResult>;

#[derive(Default)]
struct LoaderState {
    loaded: bool,
    last_known_remote_stamp: i64,
    /// In-flight loads and the requests waiting on each.
    pending: HashMap<LoadKey, Vec<Waiter>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<LoaderState>,
    observers: Mutex<Vec<Arc<dyn ChangeListLoaderObserver>>>,
}

#[derive(Clone)]
struct Deps {
    service: Arc<dyn DriveService>,
    store: Arc<dyn MetadataStore>,
    about: Arc<AboutResourceLoader>,
    controller: LoaderController,
}

#[derive(Clone)]
pub struct ChangeListLoader {
    deps: Deps,
    shared: Arc<Shared>,
}

impl ChangeListLoader {
    pub fn new(
        service: Arc<dyn DriveService>,
        store: Arc<dyn MetadataStore>,
        about: Arc<AboutResourceLoader>,
        controller: LoaderController,
    ) -> Self {
        Self {
            deps: Deps {
                service,
                store,
                about,
                controller,
            },
            shared: Arc::default(),
        }
    }

    /// True while a full or delta change list load is in flight.
    pub fn is_refreshing(&self) -> bool {
        lock(&self.shared.state)
            .pending
            .contains_key(&LoadKey::Global)
    }

    /// True once a change list load has completed, in this process or a
    /// previous one.
    pub fn is_loaded(&self) -> bool {
        lock(&self.shared.state).loaded
    }

    pub fn add_observer(&self, observer: Arc<dyn ChangeListLoaderObserver>) {
        lock(&self.shared.observers).push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ChangeListLoaderObserver>) {
        lock(&self.shared.observers).retain(|known| !Arc::ptr_eq(known, observer));
    }

    /// Starts a delta load unless one is already in flight.
    ///
    /// Returns `None` without waiting when a load is in flight: periodic
    /// polls are dropped rather than queued behind it.
    pub async fn check_for_updates(&self) -> Option<LoadResult> {
        let rx = self.start_check_for_updates()?;
        Some(wait(rx).await)
    }

    /// Makes sure the directory at `path` has been fetched.
    ///
    /// Before the first completed load this starts the initial load with the
    /// directory fetched first, and resolves once the directory's children
    /// are present. Afterwards it resolves right away and polls for updates
    /// in the background.
    pub async fn load_directory_if_needed(&self, path: &str) -> LoadResult {
        self.load_path(normalize_path(path)).await
    }

    fn load_path(&self, path: String) -> Pin<Box<dyn Future<Output = LoadResult> + Send + '_>> {
        Box::pin(async move {
            match self.deps.store.get_local_id_by_path(&path).await {
                Ok(local_id) => {
                    if self.is_loaded() {
                        self.directory_entry(local_id, &path).await?;
                        let _ = self.start_check_for_updates();
                        return Ok(());
                    }
                    self.load_resolved(local_id, &path).await
                }
                Err(MetadataError::NotFound(_)) => {
                    if self.is_loaded() {
                        return Err(LoadError::NotFound(path));
                    }
                    let Some(parent) = parent_path(&path) else {
                        return Err(LoadError::NotFound(path));
                    };
                    debug!(%path, %parent, "directory unknown, loading parent first");
                    self.load_path(parent).await?;

                    match self.deps.store.get_local_id_by_path(&path).await {
                        Ok(local_id) if self.is_loaded() => {
                            self.directory_entry(local_id, &path).await.map(|_| ())
                        }
                        Ok(local_id) => self.load_resolved(local_id, &path).await,
                        Err(MetadataError::NotFound(_)) => Err(LoadError::NotFound(path)),
                        Err(err) => Err(err.into()),
                    }
                }
                Err(err) => Err(err.into()),
            }
        })
    }

    /// Runs a change list load without fetching any directory first.
    pub async fn load_for_testing(&self) -> LoadResult {
        wait(self.load(None)).await
    }

    async fn directory_entry(
        &self,
        local_id: LocalId,
        path: &str,
    ) -> Result<EntryRecord, LoadError> {
        let entry = self
            .deps
            .store
            .get_entry(local_id)
            .await?
            .ok_or_else(|| LoadError::NotFound(path.to_string()))?;
        if !entry.is_directory {
            return Err(LoadError::NotADirectory(path.to_string()));
        }
        Ok(entry)
    }

    async fn load_resolved(&self, local_id: LocalId, path: &str) -> LoadResult {
        let entry = self.directory_entry(local_id, path).await?;
        let directory = DirectoryFetchInfo {
            local_id,
            path: path.to_string(),
            changestamp: entry.directory_changestamp,
        };
        wait(self.load(Some(directory))).await
    }

    fn start_check_for_updates(&self) -> Option<oneshot::Receiver<LoadResult>> {
        let mut state = lock(&self.shared.state);
        if state.pending.contains_key(&LoadKey::Global) {
            debug!("change list load in flight, ignoring update check");
            return None;
        }
        Some(self.register(&mut state, None))
    }

    fn load(&self, directory: Option<DirectoryFetchInfo>) -> oneshot::Receiver<LoadResult> {
        let mut state = lock(&self.shared.state);
        self.register(&mut state, directory)
    }

    /// Queues a request under its key, starting the load when the key is not
    /// already in flight.
    fn register(
        &self,
        state: &mut LoaderState,
        directory: Option<DirectoryFetchInfo>,
    ) -> oneshot::Receiver<LoadResult> {
        let (tx, rx) = oneshot::channel();
        let key = directory
            .as_ref()
            .map_or(LoadKey::Global, |dir| LoadKey::Directory(dir.local_id));
        if let Some(waiters) = state.pending.get_mut(&key) {
            debug!(?key, "joining in-flight load");
            waiters.push(tx);
            return rx;
        }

        let global_idle = !state.pending.contains_key(&LoadKey::Global);
        let is_initial = !state.loaded && global_idle;
        state.pending.insert(key.clone(), vec![tx]);
        let task = LoadTask {
            deps: self.deps.clone(),
            shared: Arc::downgrade(&self.shared),
        };

        match directory {
            None => {
                debug!(is_initial, "starting change list load");
                tokio::spawn(task.run_change_list(is_initial, None));
            }
            Some(directory) if global_idle => {
                state.pending.entry(LoadKey::Global).or_default();
                debug!(
                    is_initial,
                    path = %directory.path,
                    "starting change list load with directory first"
                );
                tokio::spawn(task.run_change_list(is_initial, Some(directory)));
            }
            Some(directory) => {
                debug!(path = %directory.path, "starting directory fetch");
                tokio::spawn(task.run_directory_fetch(directory));
            }
        }
        rx
    }

    #[cfg(test)]
    fn waiter_count(&self, key: &LoadKey) -> usize {
        lock(&self.shared.state)
            .pending
            .get(key)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for ChangeListLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("ChangeListLoader")
            .field("loaded", &state.loaded)
            .field("in_flight", &state.pending.len())
            .finish()
    }
}

/// One running load. Holds the collaborators strongly and the loader state
/// weakly.
struct LoadTask {
    deps: Deps,
    shared: Weak<Shared>,
}

impl LoadTask {
    async fn run_change_list(self, is_initial: bool, mut directory: Option<DirectoryFetchInfo>) {
        let outcome = self.load_change_list(is_initial, &mut directory).await;
        match &outcome {
            Ok(()) => {}
            Err(LoadError::Shutdown) => return,
            Err(err) => warn!(error = %err, "change list load failed"),
        }
        self.finish(&LoadKey::Global, &outcome);
        if let Some(directory) = directory {
            self.finish(&LoadKey::Directory(directory.local_id), &outcome);
        }
    }

    async fn run_directory_fetch(self, directory: DirectoryFetchInfo) {
        let outcome = self.fetch_directory_with_known_stamp(&directory).await;
        if let Err(err) = &outcome {
            if matches!(err, LoadError::Shutdown) {
                return;
            }
            warn!(path = %directory.path, error = %err, "directory fetch failed");
        }
        self.finish(&LoadKey::Directory(directory.local_id), &outcome);
    }

    async fn load_change_list(
        &self,
        is_initial: bool,
        directory: &mut Option<DirectoryFetchInfo>,
    ) -> LoadResult {
        let store = &self.deps.store;
        let local_stamp = store.get_largest_local_change_stamp().await?;

        if is_initial && local_stamp > 0 {
            info!(local_stamp, "using metadata from a previous run");
            self.mark_loaded()?;
            self.release_waiters(&LoadKey::Global)?;
            if let Some(directory) = directory.as_ref() {
                self.release_waiters(&LoadKey::Directory(directory.local_id))?;
            }
        }

        let about = self.deps.about.update_about_resource().await?;
        let remote_stamp = about.largest_change_id;
        self.with_state(|state| state.last_known_remote_stamp = remote_stamp)?;
        store.set_root_resource_id(&about.root_folder_id).await?;

        if local_stamp > 0 && local_stamp >= remote_stamp {
            debug!(local_stamp, remote_stamp, "metadata is up to date");
            self.complete_change_list(AffectedDirectories::new())?;
            return Ok(());
        }

        // The directory's requests are answered here; whatever fails later
        // only concerns the change list.
        if let Some(directory) = directory.take() {
            let fetched = self.fetch_directory(&directory, remote_stamp).await;
            if matches!(fetched, Err(LoadError::Shutdown)) {
                return fetched;
            }
            if let Err(err) = &fetched {
                warn!(path = %directory.path, error = %err, "directory fetch failed");
            }
            self.finish(&LoadKey::Directory(directory.local_id), &fetched);
        }

        let start = if local_stamp > 0 { local_stamp + 1 } else { 0 };
        let entries = self.fetch_change_list(start).await?;
        let largest = entries
            .iter()
            .map(|entry| entry.change_stamp)
            .fold(remote_stamp.max(local_stamp), i64::max);

        let affected = {
            let _turn = self.deps.controller.wait_for_turn().await;
            store
                .apply_change_entries(&entries, local_stamp == 0, largest)
                .await?
        };
        info!(
            entries = entries.len(),
            largest_stamp = largest,
            full = local_stamp == 0,
            "applied change list"
        );
        self.complete_change_list(affected)
    }

    async fn fetch_change_list(&self, start: i64) -> Result<Vec<ChangeEntry>, LoadError> {
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = self
                .deps
                .service
                .fetch_changelist(start, page_token.as_deref())
                .await?;
            pages += 1;
            entries.extend(page.entries);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(start, pages, entries = entries.len(), "fetched change list");
        Ok(entries)
    }

    async fn fetch_directory_with_known_stamp(
        &self,
        directory: &DirectoryFetchInfo,
    ) -> LoadResult {
        let known = self.with_state(|state| state.last_known_remote_stamp)?;
        let remote_stamp = if known > 0 {
            known
        } else {
            let about = self.deps.about.get_about_resource().await?;
            self.deps
                .store
                .set_root_resource_id(&about.root_folder_id)
                .await?;
            about.largest_change_id
        };
        self.fetch_directory(directory, remote_stamp).await
    }

    async fn fetch_directory(
        &self,
        directory: &DirectoryFetchInfo,
        remote_stamp: i64,
    ) -> LoadResult {
        let store = &self.deps.store;
        let local_stamp = store.get_largest_local_change_stamp().await?;
        if directory.changestamp.max(local_stamp) >= remote_stamp {
            debug!(path = %directory.path, remote_stamp, "directory is fresh");
            return Ok(());
        }

        let entry = store
            .get_entry(directory.local_id)
            .await?
            .ok_or_else(|| LoadError::NotFound(directory.path.clone()))?;
        let Some(resource_id) = entry.resource_id else {
            return Err(LoadError::NotFound(directory.path.clone()));
        };

        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .deps
                .service
                .fetch_directory_children(&resource_id, page_token.as_deref())
                .await?;
            entries.extend(page.entries);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let affected = {
            let _turn = self.deps.controller.wait_for_turn().await;
            store
                .refresh_directory(directory.local_id, &entries, remote_stamp)
                .await?
        };
        debug!(path = %directory.path, entries = entries.len(), "fetched directory");

        let observers = self.observers()?;
        for path in &affected {
            for observer in &observers {
                observer.on_directory_changed(path);
            }
        }
        let scope = LoadScope::Directory(directory.path.clone());
        for observer in &observers {
            observer.on_load_completed(&scope);
        }
        Ok(())
    }

    fn complete_change_list(&self, affected: AffectedDirectories) -> LoadResult {
        self.mark_loaded()?;
        let observers = self.observers()?;
        for path in &affected {
            for observer in &observers {
                observer.on_directory_changed(path);
            }
        }
        for observer in &observers {
            observer.on_load_completed(&LoadScope::ChangeList);
        }
        Ok(())
    }

    fn mark_loaded(&self) -> LoadResult {
        let first = self.with_state(|state| !std::mem::replace(&mut state.loaded, true))?;
        if first {
            info!("initial load complete");
            for observer in self.observers()? {
                observer.on_initial_load_complete();
            }
        }
        Ok(())
    }

    /// Answers the requests queued so far with success while the load goes on.
    fn release_waiters(&self, key: &LoadKey) -> LoadResult {
        let waiters = self.with_state(|state| {
            state
                .pending
                .get_mut(key)
                .map(std::mem::take)
                .unwrap_or_default()
        })?;
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        Ok(())
    }

    /// Ends the load for `key` and hands `outcome` to everything queued on it.
    fn finish(&self, key: &LoadKey, outcome: &LoadResult) {
        let waiters = self
            .with_state(|state| state.pending.remove(key))
            .ok()
            .flatten()
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LoaderState) -> T) -> Result<T, LoadError> {
        let shared = self.shared.upgrade().ok_or(LoadError::Shutdown)?;
        let mut state = lock(&shared.state);
        Ok(f(&mut state))
    }

    /// Snapshot of the observer list, so observers may add or remove
    /// observers while being notified.
    fn observers(&self) -> Result<Vec<Arc<dyn ChangeListLoaderObserver>>, LoadError> {
        let shared = self.shared.upgrade().ok_or(LoadError::Shutdown)?;
        let observers = lock(&shared.observers).clone();
        Ok(observers)
    }
}

async fn wait(rx: oneshot::Receiver<LoadResult>) -> LoadResult {
    rx.await.unwrap_or(Err(LoadError::Shutdown))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "change_list_loader_tests.rs"]
mod tests;

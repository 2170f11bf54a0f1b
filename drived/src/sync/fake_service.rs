//! Scripted in-process [`DriveService`] for loader tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use drive_core::{AboutSnapshot, ChangeEntry, ChangeListPage, DriveError, DriveService};
use tokio::sync::watch;

pub const ROOT_ID: &str = "root";

/// Open/closed switch a fake endpoint waits on before answering.
pub struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: watch::Sender::new(true),
        }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    pub fn close(&self) {
        self.open.send_replace(false);
    }

    async fn pass(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Default)]
struct Script {
    largest_change_id: Option<i64>,
    /// Remote change log in stamp order.
    log: Vec<ChangeEntry>,
    about_failures: VecDeque<DriveError>,
    changelist_failures: VecDeque<DriveError>,
    children_failures: BTreeMap<String, VecDeque<DriveError>>,
}

pub struct FakeDrive {
    script: Mutex<Script>,
    page_size: usize,
    about_gate: Gate,
    changelist_gate: Gate,
    children_gate: Gate,
    about_calls: AtomicUsize,
    changelist_calls: AtomicUsize,
    children_calls: Mutex<Vec<String>>,
}

impl FakeDrive {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            script: Mutex::new(Script::default()),
            page_size,
            about_gate: Gate::new(),
            changelist_gate: Gate::new(),
            children_gate: Gate::new(),
            about_calls: AtomicUsize::new(0),
            changelist_calls: AtomicUsize::new(0),
            children_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_changes(entries: Vec<ChangeEntry>) -> Self {
        let fake = Self::new();
        fake.push_changes(entries);
        fake
    }

    /// Appends to the remote change log.
    pub fn push_changes(&self, entries: Vec<ChangeEntry>) {
        self.script().log.extend(entries);
    }

    /// Overrides the stamp reported by the about endpoint, which otherwise
    /// follows the change log.
    pub fn set_largest_change_id(&self, stamp: i64) {
        self.script().largest_change_id = Some(stamp);
    }

    pub fn fail_next_about(&self, err: DriveError) {
        self.script().about_failures.push_back(err);
    }

    pub fn fail_next_changelist(&self, err: DriveError) {
        self.script().changelist_failures.push_back(err);
    }

    pub fn fail_next_children(&self, directory_id: &str, err: DriveError) {
        self.script()
            .children_failures
            .entry(directory_id.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn about_gate(&self) -> &Gate {
        &self.about_gate
    }

    pub fn changelist_gate(&self) -> &Gate {
        &self.changelist_gate
    }

    pub fn children_gate(&self) -> &Gate {
        &self.children_gate
    }

    pub fn about_calls(&self) -> usize {
        self.about_calls.load(Ordering::SeqCst)
    }

    pub fn changelist_calls(&self) -> usize {
        self.changelist_calls.load(Ordering::SeqCst)
    }

    pub fn children_calls(&self, directory_id: &str) -> usize {
        self.children_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == directory_id)
            .count()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    fn page(&self, entries: Vec<ChangeEntry>, page_token: Option<&str>) -> ChangeListPage {
        let offset: usize = page_token.map_or(0, |token| token.parse().unwrap());
        let end = (offset + self.page_size).min(entries.len());
        ChangeListPage {
            entries: entries[offset.min(end)..end].to_vec(),
            next_page_token: (end < entries.len()).then(|| end.to_string()),
        }
    }
}

#[async_trait]
impl DriveService for FakeDrive {
    async fn fetch_about(&self) -> Result<AboutSnapshot, DriveError> {
        self.about_calls.fetch_add(1, Ordering::SeqCst);
        self.about_gate.pass().await;
        let mut script = self.script();
        if let Some(err) = script.about_failures.pop_front() {
            return Err(err);
        }
        let largest = script.largest_change_id.unwrap_or_else(|| {
            script
                .log
                .iter()
                .map(|entry| entry.change_stamp)
                .max()
                .unwrap_or(0)
        });
        Ok(AboutSnapshot {
            largest_change_id: largest,
            quota_bytes_total: 1 << 30,
            quota_bytes_used: 1 << 20,
            root_folder_id: ROOT_ID.to_string(),
        })
    }

    async fn fetch_changelist(
        &self,
        start_change_stamp: i64,
        page_token: Option<&str>,
    ) -> Result<ChangeListPage, DriveError> {
        self.changelist_calls.fetch_add(1, Ordering::SeqCst);
        self.changelist_gate.pass().await;
        let entries = {
            let mut script = self.script();
            if let Some(err) = script.changelist_failures.pop_front() {
                return Err(err);
            }
            script
                .log
                .iter()
                .filter(|entry| entry.change_stamp >= start_change_stamp)
                .cloned()
                .collect()
        };
        Ok(self.page(entries, page_token))
    }

    async fn fetch_directory_children(
        &self,
        directory_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChangeListPage, DriveError> {
        self.children_calls
            .lock()
            .unwrap()
            .push(directory_id.to_string());
        self.children_gate.pass().await;
        let entries = {
            let mut script = self.script();
            if let Some(err) = script
                .children_failures
                .get_mut(directory_id)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            let mut latest: BTreeMap<&str, &ChangeEntry> = BTreeMap::new();
            for entry in &script.log {
                latest.insert(entry.id.as_str(), entry);
            }
            latest
                .into_values()
                .filter(|entry| !entry.deleted && entry.parent_ids.contains(directory_id))
                .cloned()
                .collect()
        };
        Ok(self.page(entries, page_token))
    }
}

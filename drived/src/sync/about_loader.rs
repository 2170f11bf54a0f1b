use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use drive_core::{AboutSnapshot, DriveError, DriveService};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type AboutResult = Result<AboutSnapshot, Arc<DriveError>>;

#[derive(Default)]
struct AboutState {
    cached: Option<AboutSnapshot>,
    /// `Some` while a fetch started by [`AboutResourceLoader::get_about_resource`]
    /// is in flight; holds the callers that joined it.
    waiters: Option<Vec<oneshot::Sender<AboutResult>>>,
}

/// Caches the account snapshot and coalesces concurrent first reads onto a
/// single fetch.
pub struct AboutResourceLoader {
    service: Arc<dyn DriveService>,
    state: Mutex<AboutState>,
}

impl AboutResourceLoader {
    pub fn new(service: Arc<dyn DriveService>) -> Self {
        Self {
            service,
            state: Mutex::new(AboutState::default()),
        }
    }

    pub fn cached_about_resource(&self) -> Option<AboutSnapshot> {
        self.lock_state().cached.clone()
    }

    /// Returns the cached snapshot, fetching it once if nothing is cached yet.
    pub async fn get_about_resource(&self) -> AboutResult {
        loop {
            let joined = {
                let mut state = self.lock_state();
                if let Some(about) = &state.cached {
                    return Ok(about.clone());
                }
                match state.waiters.as_mut() {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        state.waiters = Some(Vec::new());
                        None
                    }
                }
            };

            match joined {
                Some(rx) => {
                    debug!("joining in-flight about fetch");
                    // A dropped sender means the leading caller was cancelled.
                    if let Ok(result) = rx.await {
                        return result;
                    }
                }
                None => {
                    let flight = InFlight {
                        loader: self,
                        armed: true,
                    };
                    let result = self.fetch().await;
                    flight.finish(&result);
                    return result;
                }
            }
        }
    }

    /// Fetches a fresh snapshot regardless of the cache.
    ///
    /// Failures leave the cache untouched.
    pub async fn update_about_resource(&self) -> AboutResult {
        self.fetch().await
    }

    async fn fetch(&self) -> AboutResult {
        debug!("fetching about resource");
        let result = self.service.fetch_about().await.map_err(Arc::new);
        match &result {
            Ok(about) => self.store(about),
            Err(err) => warn!(error = %err, "about fetch failed"),
        }
        result
    }

    fn store(&self, about: &AboutSnapshot) {
        let mut state = self.lock_state();
        match &state.cached {
            Some(current) if current.largest_change_id > about.largest_change_id => {
                warn!(
                    cached = current.largest_change_id,
                    fetched = about.largest_change_id,
                    "ignoring about snapshot older than the cached one"
                );
            }
            _ => state.cached = Some(about.clone()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AboutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the caller that leads a fetch; releases the callers joined on it.
/// Dropping it without `finish` (the fetch was cancelled) drops their
/// senders so they retry.
struct InFlight<'a> {
    loader: &'a AboutResourceLoader,
    armed: bool,
}

impl InFlight<'_> {
    fn finish(mut self, result: &AboutResult) {
        self.armed = false;
        let waiters = self.loader.lock_state().waiters.take();
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // Once finished, the waiter list may already belong to a newer leader.
        if self.armed {
            self.loader.lock_state().waiters.take();
        }
    }
}

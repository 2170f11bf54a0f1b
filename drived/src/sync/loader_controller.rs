//! Reference-counted gate that defers metadata writes.
//!
//! While any [`Lock`] is alive, tasks submitted through
//! [`LoaderController::schedule_run`] are queued. When the last lock is
//! released the queue drains in submission order on the releasing thread.
//! Draining stops as soon as a drained task takes a new lock; the remaining
//! tasks stay queued until that lock is released too.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::oneshot;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct GateState {
    lock_count: usize,
    pending: VecDeque<Task>,
    draining: bool,
}

#[derive(Clone, Default)]
pub struct LoaderController {
    state: Arc<Mutex<GateState>>,
}

/// Outstanding hold on a [`LoaderController`]. Dropping it releases the hold.
#[must_use = "the gate reopens as soon as the lock is dropped"]
pub struct Lock {
    state: Weak<Mutex<GateState>>,
}

impl LoaderController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_lock(&self) -> Lock {
        lock_state(&self.state).lock_count += 1;
        Lock {
            state: Arc::downgrade(&self.state),
        }
    }

    /// Runs `task` right away when no lock is held, otherwise queues it.
    pub fn schedule_run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = lock_state(&self.state);
        if state.lock_count == 0 && !state.draining && state.pending.is_empty() {
            drop(state);
            task();
        } else {
            state.pending.push_back(Box::new(task));
        }
    }

    /// Waits until the gate is open and returns a lock that keeps it closed
    /// for the caller's write.
    ///
    /// The lock is taken inside the scheduled task itself, so no other queued
    /// writer can slip in between the gate opening and the caller resuming.
    pub async fn wait_for_turn(&self) -> Lock {
        let (tx, rx) = oneshot::channel();
        let state = Arc::downgrade(&self.state);
        self.schedule_run(move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            // If the waiter went away the returned lock is dropped here,
            // which releases it again.
            let _ = tx.send(LoaderController { state }.acquire_lock());
        });
        match rx.await {
            Ok(lock) => lock,
            Err(_) => self.acquire_lock(),
        }
    }

    pub fn is_locked(&self) -> bool {
        lock_state(&self.state).lock_count > 0
    }

    pub fn lock_count(&self) -> usize {
        lock_state(&self.state).lock_count
    }

    pub fn pending_tasks(&self) -> usize {
        lock_state(&self.state).pending.len()
    }
}

impl std::fmt::Debug for LoaderController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_state(&self.state);
        f.debug_struct("LoaderController")
            .field("lock_count", &state.lock_count)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            release(&state);
        }
    }
}

fn release(state: &Arc<Mutex<GateState>>) {
    {
        let mut guard = lock_state(state);
        guard.lock_count = guard.lock_count.saturating_sub(1);
        // A release from inside a drained task leaves the outer drain loop
        // in charge of the queue.
        if guard.lock_count > 0 || guard.draining {
            return;
        }
        guard.draining = true;
    }
    drain(state);
}

fn drain(state: &Arc<Mutex<GateState>>) {
    loop {
        let task = {
            let mut guard = lock_state(state);
            if guard.lock_count > 0 {
                guard.draining = false;
                return;
            }
            match guard.pending.pop_front() {
                Some(task) => task,
                None => {
                    guard.draining = false;
                    return;
                }
            }
        };
        // Run outside the mutex: tasks may lock, unlock or schedule again.
        task();
    }
}

fn lock_state(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Background eviction of stale, unreferenced cache content.
//!
//! One thread sleeps on a condition variable with a timed wait. Each
//! wakeup runs a purge pass unless shutdown was requested; shutdown
//! signals the condition and joins, so unmount never leaves the thread
//! behind.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex};

use super::store::CacheStore;

/// Source of uuids that must never be evicted.
pub trait LiveUuids: Send + Sync + 'static {
    fn live_uuids(&self) -> HashSet<String>;
}

struct Shared {
    shutdown: Mutex<bool>,
    wakeup: Condvar,
}

/// Handle on the background housekeeping thread.
pub struct Housekeeper {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Housekeeper {
    pub fn spawn(
        interval: Duration,
        retention: Duration,
        store: Arc<CacheStore>,
        live: Arc<dyn LiveUuids>,
    ) -> Self {
        let shared = Arc::new(Shared {
            shutdown: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("repofs-housekeeping".into())
            .spawn(move || {
                tracing::debug!(interval_secs = interval.as_secs(), "housekeeping started");
                loop {
                    let mut shutdown = thread_shared.shutdown.lock();
                    if *shutdown {
                        break;
                    }
                    thread_shared.wakeup.wait_for(&mut shutdown, interval);
                    if *shutdown {
                        break;
                    }
                    drop(shutdown);

                    let removed = purge_pass(&store, live.as_ref(), retention);
                    if removed > 0 {
                        tracing::info!(removed, "evicted stale cache entries");
                    }
                }
                tracing::debug!("housekeeping exiting");
            })
            .expect("spawn housekeeping thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Request shutdown and block until the thread has terminated.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if let Some(handle) = self.handle.take() {
            *self.shared.shutdown.lock() = true;
            self.shared.wakeup.notify_all();
            if handle.join().is_err() {
                tracing::error!("housekeeping thread panicked");
            }
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

/// Remove cache files that are both unreferenced and older than the
/// retention window. Returns the number of evicted entries.
pub fn purge_pass(store: &CacheStore, live: &dyn LiveUuids, retention: Duration) -> usize {
    let cutoff = SystemTime::now() - retention;
    let live = live.live_uuids();
    let entries = match store.content_entries() {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "cannot enumerate cache dir");
            return 0;
        }
    };

    let mut removed = 0;
    for (uuid, path) in entries {
        if live.contains(&uuid) {
            continue;
        }
        let stale = path
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| mtime < cutoff)
            .unwrap_or(false);
        if !stale {
            continue;
        }
        match store.remove(&uuid) {
            Ok(()) => {
                tracing::debug!(uuid, "evicted cache entry");
                removed += 1;
            }
            Err(e) => tracing::warn!(uuid, error = %e, "eviction failed"),
        }
    }
    removed
}

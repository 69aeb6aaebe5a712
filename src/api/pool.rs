//! Bounded pool of reusable HTTP client handles.
//!
//! A handle wraps a blocking `reqwest::Client` and keeps its persistent
//! connections warm between operations. Ownership is binary: a handle is
//! either idle in the pool or held by exactly one executing operation.
//! The guard returned by [`ClientPool::acquire`] gives the handle back on
//! drop, so every error path releases exactly once.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::blocking::Client;

use crate::error::FsError;

/// One reusable transport handle.
#[derive(Debug)]
pub struct HttpHandle {
    client: Client,
}

impl HttpHandle {
    fn build(timeout: Duration) -> Result<Self, FsError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Drop per-operation state before the handle changes hands.
    ///
    /// Request state lives in per-call builders and never outlives the
    /// operation; only the warm connections carry over.
    fn reset(&mut self) {}

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Free list of idle handles, bounded by the configured maximum.
#[derive(Debug)]
pub struct ClientPool {
    idle: Mutex<Vec<HttpHandle>>,
    max_idle: usize,
    timeout: Duration,
}

impl ClientPool {
    pub fn new(max_idle: usize, timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            timeout,
        }
    }

    /// Pop an idle handle, or build a fresh one if the pool is empty.
    pub fn acquire(self: &Arc<Self>) -> Result<PoolGuard, FsError> {
        let reused = self.idle.lock().pop();
        let handle = match reused {
            Some(mut handle) => {
                tracing::trace!("reusing pooled http handle");
                handle.reset();
                handle
            }
            None => {
                tracing::trace!("building new http handle");
                HttpHandle::build(self.timeout)?
            }
        };
        Ok(PoolGuard {
            pool: Arc::clone(self),
            handle: Some(handle),
        })
    }

    fn release(&self, mut handle: HttpHandle) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            handle.reset();
            idle.push(handle);
        } else {
            tracing::trace!(max = self.max_idle, "pool full, discarding http handle");
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Exclusive loan of a handle; returns it to the pool on drop.
pub struct PoolGuard {
    pool: Arc<ClientPool>,
    handle: Option<HttpHandle>,
}

impl Deref for PoolGuard {
    type Target = HttpHandle;

    fn deref(&self) -> &HttpHandle {
        self.handle.as_ref().expect("handle present until drop")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize) -> Arc<ClientPool> {
        Arc::new(ClientPool::new(max, Duration::from_secs(5)))
    }

    #[test]
    fn guard_returns_handle_on_drop() {
        let pool = pool(4);
        assert_eq!(pool.idle_count(), 0);

        let guard = pool.acquire().unwrap();
        assert_eq!(pool.idle_count(), 0);
        drop(guard);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn idle_count_never_exceeds_max() {
        let pool = pool(2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        drop(a);
        drop(b);
        drop(c);

        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn acquire_prefers_pooled_handles() {
        let pool = pool(4);
        drop(pool.acquire().unwrap());
        assert_eq!(pool.idle_count(), 1);

        let guard = pool.acquire().unwrap();
        assert_eq!(pool.idle_count(), 0);
        drop(guard);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn zero_capacity_pool_retains_nothing() {
        let pool = pool(0);
        drop(pool.acquire().unwrap());
        assert_eq!(pool.idle_count(), 0);
    }
}

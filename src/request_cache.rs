//! In-flight collection-request dedup cache.
//!
//! Concurrent callers asking for the same normalized query share one pending
//! future instead of each issuing their own adapter call. A failed future is
//! evicted immediately so the next caller retries rather than inheriting a
//! cached error.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::error::EngineError;

type PendingFuture<T> = Shared<BoxFuture<'static, Result<T, EngineError>>>;

enum Slot<T> {
    Pending(PendingFuture<T>),
    Ready { value: T, inserted_at: u64 },
}

pub struct RequestCache<T> {
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
    entries: Mutex<HashMap<String, Slot<T>>>,
}

impl<T: Clone + Send + Sync + 'static> RequestCache<T> {
    pub fn new(clock: Arc<dyn Clock>, ttl_secs: u64) -> Self {
        Self {
            clock,
            ttl_secs,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value for `key` if fresh; otherwise runs `factory`
    /// (coalescing concurrent callers) and caches the result. `skip_cache`
    /// bypasses coalescing entirely, as a force-refresh escape hatch.
    pub async fn get_or_insert_with<F, Fut>(&self, key: &str, skip_cache: bool, factory: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        if skip_cache {
            return factory().await;
        }

        let now = self.clock.now_unix();
        let pending: PendingFuture<T> = {
            let mut entries = self.entries.lock().expect("request cache lock poisoned");
            match entries.get(key) {
                Some(Slot::Ready { value, inserted_at }) if now.saturating_sub(*inserted_at) < self.ttl_secs => {
                    return Ok(value.clone());
                }
                Some(Slot::Pending(fut)) => fut.clone(),
                _ => {
                    let boxed: Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send>> = Box::pin(factory());
                    let shared = boxed.shared();
                    entries.insert(key.to_string(), Slot::Pending(shared.clone()));
                    shared
                }
            }
        };

        let result = pending.await;
        let mut entries = self.entries.lock().expect("request cache lock poisoned");
        match &result {
            Ok(value) => {
                entries.insert(
                    key.to_string(),
                    Slot::Ready {
                        value: value.clone(),
                        inserted_at: now,
                    },
                );
            }
            Err(_) => {
                entries.remove(key);
            }
        }
        result
    }

    /// Evicts Ready entries past their TTL. Pending entries are left alone —
    /// they resolve (and self-evict on error) on their own.
    pub fn sweep(&self) {
        let now = self.clock.now_unix();
        let ttl_secs = self.ttl_secs;
        self.entries
            .lock()
            .expect("request cache lock poisoned")
            .retain(|_, slot| match slot {
                Slot::Ready { inserted_at, .. } => now.saturating_sub(*inserted_at) < ttl_secs,
                Slot::Pending(_) => true,
            });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("request cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

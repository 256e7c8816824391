//! Abstract KV substrate: the durable queue/lock building block the engine
//! is built against. A real backing store is out of scope; an in-memory
//! implementation exercises the same contract so a single process sees
//! identical observable behavior whether or not a real KV is wired in.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::clock::Clock;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<u64>,
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Atomic "set if absent with expiry". Returns `true` if the value was
    /// written (key was absent or expired), `false` if an unexpired value
    /// already existed and `if_absent` was requested.
    async fn set(&self, key: &str, value: &[u8], expiry_secs: Option<u64>, if_absent: bool) -> KvResult<bool>;
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;
    async fn del(&self, key: &str) -> KvResult<()>;
    async fn exists(&self, key: &str) -> KvResult<bool>;
    /// Atomic "delete only if the current value still equals `expected`".
    /// Returns `true` if the key was deleted. The single-flight lock relies
    /// on this to release safely: a plain get-then-del has a window where
    /// the TTL can expire and a new holder can acquire between the two
    /// calls, so release() must never be two round trips.
    async fn delete_if_match(&self, key: &str, expected: &[u8]) -> KvResult<bool>;
}

/// KV operations can fail transiently (network blip to the real substrate).
/// Callers treat any `Err` as "not acquired" / "unknown", never as a crash.
#[derive(Debug, thiserror::Error)]
#[error("kv store unavailable: {0}")]
pub struct KvError(pub String);

pub type KvResult<T> = Result<T, KvError>;

/// In-memory reference implementation. Single-process only: it provides
/// correct behavior for one instance, not cross-instance linearizability.
pub struct InMemoryKvStore {
    clock: std::sync::Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn is_live(&self, entry: &Entry, now: u64) -> bool {
        entry.expires_at.map_or(true, |exp| now < exp)
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set(&self, key: &str, value: &[u8], expiry_secs: Option<u64>, if_absent: bool) -> KvResult<bool> {
        let now = self.clock.now_unix();
        let mut entries = self.entries.lock().expect("kv store lock poisoned");

        if if_absent {
            if let Some(existing) = entries.get(key) {
                if self.is_live(existing, now) {
                    return Ok(false);
                }
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: expiry_secs.map(|s| now + s),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let now = self.clock.now_unix();
        let entries = self.entries.lock().expect("kv store lock poisoned");
        Ok(entries
            .get(key)
            .filter(|e| self.is_live(e, now))
            .map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        self.entries
            .lock()
            .expect("kv store lock poisoned")
            .remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete_if_match(&self, key: &str, expected: &[u8]) -> KvResult<bool> {
        let now = self.clock.now_unix();
        let mut entries = self.entries.lock().expect("kv store lock poisoned");
        let matches = entries.get(key).filter(|e| self.is_live(e, now)).is_some_and(|e| e.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}

//! Cancellation registry.
//!
//! Cross-instance visibility goes through the KV store (fail-open when it's
//! unreachable). A process-local `broadcast` channel is layered on top purely
//! as a wake-up optimization — it lets a worker in this process notice a
//! cancel without waiting for its next poll, but the KV poll at each stage
//! boundary remains the actual source of truth.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::kv::KvStore;
use crate::model::RunId;

fn cancel_key(run_id: &RunId) -> String {
    format!("cancelled_runs:{run_id}")
}

pub struct CancellationRegistry {
    kv: Arc<dyn KvStore>,
    ttl_secs: u64,
    local_signal: broadcast::Sender<RunId>,
}

impl CancellationRegistry {
    pub fn new(kv: Arc<dyn KvStore>, ttl_secs: u64) -> Self {
        let (local_signal, _) = broadcast::channel(64);
        Self {
            kv,
            ttl_secs,
            local_signal,
        }
    }

    pub async fn mark_cancelled(&self, run_id: &RunId) {
        if let Err(err) = self.kv.set(&cancel_key(run_id), b"1", Some(self.ttl_secs), false).await {
            tracing::warn!(run_id = %run_id, error = %err, "failed to publish cancellation to kv store");
        }
        // Fire-and-forget: no receivers is not an error.
        let _ = self.local_signal.send(run_id.clone());
    }

    /// Fail-open: if the KV store is unreachable, the run continues.
    pub async fn is_cancelled(&self, run_id: &RunId) -> bool {
        match self.kv.exists(&cancel_key(run_id)).await {
            Ok(cancelled) => cancelled,
            Err(err) => {
                tracing::debug!(run_id = %run_id, error = %err, "kv unreachable; cancellation check fails open");
                false
            }
        }
    }

    /// Subscribe to the local wake-up channel. Workers may `select!` this
    /// against their normal work to notice a cancel sooner than the next
    /// stage-boundary poll, but must still treat `is_cancelled` as the
    /// authority.
    pub fn subscribe(&self) -> broadcast::Receiver<RunId> {
        self.local_signal.subscribe()
    }
}

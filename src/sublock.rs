//! Distributed single-flight lock.
//!
//! One process holds one KV-backed lock per subscription, so many
//! subscriptions can run concurrently across a horizontally scaled fleet
//! while guaranteeing at most one run per subscription at a time.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::kv::KvStore;
use crate::model::SubscriptionId;

fn lock_key(sub_id: &SubscriptionId) -> String {
    format!("lock:subscription:{sub_id}")
}

#[derive(Debug, Serialize, Deserialize)]
struct LockValue {
    holder: String,
    acquired_at: u64,
}

pub struct SubLock {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    holder_id: String,
    /// Fallback set used only when the KV store is unreachable. Gives up
    /// cross-instance safety — logged at warn level every time it's
    /// exercised.
    local_fallback: Mutex<HashSet<SubscriptionId>>,
    /// This instance's own view of what it currently holds, for
    /// `diagnostics()`. Not a fleet-wide survey — the KV store has no scan
    /// primitive in scope (§6) — but it's exact for the instance that owns it.
    held: Mutex<HashSet<SubscriptionId>>,
    /// The exact encoded `LockValue` this instance wrote on its last
    /// successful acquire, keyed by subscription — release() compares
    /// against this so it only deletes a KV entry it actually still owns.
    last_written: Mutex<HashMap<SubscriptionId, Vec<u8>>>,
}

impl SubLock {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, holder_id: String) -> Self {
        Self {
            kv,
            clock,
            holder_id,
            local_fallback: Mutex::new(HashSet::new()),
            held: Mutex::new(HashSet::new()),
            last_written: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, sub_id: &SubscriptionId, ttl_secs: u64) -> bool {
        let value = LockValue {
            holder: self.holder_id.clone(),
            acquired_at: self.clock.now_unix(),
        };
        let encoded = serde_json::to_vec(&value).expect("LockValue always serializes");

        let acquired = match self.kv.set(&lock_key(sub_id), &encoded, Some(ttl_secs), true).await {
            Ok(acquired) => acquired,
            Err(err) => {
                tracing::warn!(
                    subscription_id = %sub_id,
                    error = %err,
                    "kv store unreachable; falling back to process-local lock (cross-instance safety degraded)"
                );
                self.local_fallback.lock().expect("sublock fallback poisoned").insert(sub_id.clone())
            }
        };
        if acquired {
            self.held.lock().expect("sublock held-set poisoned").insert(sub_id.clone());
            self.last_written.lock().expect("sublock last_written poisoned").insert(sub_id.clone(), encoded);
        }
        acquired
    }

    /// Only deletes the KV entry if it still holds the exact value this
    /// instance wrote at acquire time — a stale release (e.g. after the TTL
    /// expired and another instance already acquired it) must not evict
    /// someone else's live lock. Goes through `KvStore::delete_if_match` so
    /// the check-and-delete is one atomic round trip, not a get followed by
    /// a separate del that a concurrent acquire could race between.
    pub async fn release(&self, sub_id: &SubscriptionId) {
        if let Some(raw) = self.last_written.lock().expect("sublock last_written poisoned").get(sub_id).cloned() {
            match self.kv.delete_if_match(&lock_key(sub_id), &raw).await {
                Ok(false) => {
                    tracing::warn!(subscription_id = %sub_id, "skipping release; lock is now held by a different instance");
                }
                Ok(true) => {}
                Err(err) => {
                    tracing::warn!(subscription_id = %sub_id, error = %err, "lock release failed; ttl will reclaim it");
                }
            }
        }
        self.last_written.lock().expect("sublock last_written poisoned").remove(sub_id);
        self.local_fallback.lock().expect("sublock fallback poisoned").remove(sub_id);
        self.held.lock().expect("sublock held-set poisoned").remove(sub_id);
    }

    pub async fn is_held(&self, sub_id: &SubscriptionId) -> bool {
        match self.kv.exists(&lock_key(sub_id)).await {
            Ok(held) => held,
            Err(_) => self.local_fallback.lock().expect("sublock fallback poisoned").contains(sub_id),
        }
    }

    /// This instance's current lock set, for `diagnostics()`.
    pub fn held_locks(&self) -> Vec<SubscriptionId> {
        self.held.lock().expect("sublock held-set poisoned").iter().cloned().collect()
    }
}

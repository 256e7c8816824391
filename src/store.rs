//! Durable store: the relational-style home for `Subscription`, `Run`, and
//! the persistent `JobMatch` cache. Only an in-memory implementation is in
//! scope here; a real schema/driver is explicitly out of scope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use crate::model::{JobMatch, Run, RunId, RunStatus, Subscription, SubscriptionId};

#[derive(Debug, thiserror::Error)]
#[error("durable store error: {0}")]
pub struct StoreError(pub String);

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    async fn get_subscription(&self, id: &SubscriptionId) -> StoreResult<Option<Subscription>>;
    async fn put_subscription(&self, sub: Subscription) -> StoreResult<()>;

    /// Eligible subscriptions ordered by `nextRunAt ASC NULLS FIRST`, capped
    /// at `limit`.
    async fn due_subscriptions(&self, now: u64, limit: usize) -> StoreResult<Vec<Subscription>>;

    async fn get_run(&self, id: &RunId) -> StoreResult<Option<Run>>;
    async fn put_run(&self, run: Run) -> StoreResult<()>;

    /// Runs in `Running` status older than `max_age_secs`.
    async fn stale_running_runs(&self, now: u64, max_age_secs: u64) -> StoreResult<Vec<Run>>;

    /// Runs in `Running` status whose checkpoint's implicit timestamp (we use
    /// `started_at` as a stand-in: the pipeline driver re-checkpoints on
    /// every stage, so a checkpoint-less run is one that never left stage 0)
    /// has not moved in `min_minutes`, i.e. no checkpoint has ever been
    /// written for it after `min_minutes` of wall time.
    async fn running_runs_without_checkpoint(&self, now: u64, min_minutes: u64) -> StoreResult<Vec<Run>>;

    /// Runs in `Running` status that DO have a checkpoint and are within
    /// `max_age_secs` of `now` — spec.md §4.9's "interrupted runs (recent +
    /// running + has checkpoint)" startup-recovery bucket, a crash that hit
    /// mid-pipeline after making at least some progress. `max_age_secs` is
    /// ordinarily the same staleness bound `fail_stale_runs` was just called
    /// with, so this only ever sees runs that sweep left behind.
    async fn recent_running_runs_with_checkpoint(&self, now: u64, max_age_secs: u64) -> StoreResult<Vec<Run>>;

    async fn get_job_match(&self, job_content_hash: &str, resume_hash: &str) -> StoreResult<Option<JobMatch>>;
    async fn put_job_match(&self, m: JobMatch) -> StoreResult<()>;

    /// Most recently completed `Failed` runs, newest first, capped at
    /// `limit`. Feeds the control surface's `diagnostics()`.
    async fn recent_failed_runs(&self, limit: usize) -> StoreResult<Vec<Run>>;
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    runs: HashMap<RunId, Run>,
    job_matches: HashMap<(String, String), JobMatch>,
}

pub struct InMemoryDurableStore {
    inner: Mutex<Inner>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk shape of an `InMemoryDurableStore`, used only by the optional
/// `--state-file` fallback path (no real database driver is in scope).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub subscriptions: Vec<Subscription>,
    pub runs: Vec<Run>,
    pub job_matches: Vec<JobMatch>,
}

impl InMemoryDurableStore {
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.lock().expect("store lock poisoned");
        StoreSnapshot {
            subscriptions: inner.subscriptions.values().cloned().collect(),
            runs: inner.runs.values().cloned().collect(),
            job_matches: inner.job_matches.values().cloned().collect(),
        }
    }

    pub fn restore(snapshot: StoreSnapshot) -> Self {
        let mut inner = Inner::default();
        for sub in snapshot.subscriptions {
            inner.subscriptions.insert(sub.id.clone(), sub);
        }
        for run in snapshot.runs {
            inner.runs.insert(run.id.clone(), run);
        }
        for m in snapshot.job_matches {
            inner.job_matches.insert((m.job_content_hash.clone(), m.resume_hash.clone()), m);
        }
        Self { inner: Mutex::new(inner) }
    }

    /// Loads a JSON snapshot from `path` if it exists, otherwise starts
    /// empty (and leaves `path` to be created on the first `save`). Mirrors
    /// the teacher's `KeeperState::load_or_init`.
    pub fn load_or_init(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = fs::read_to_string(path)?;
        let snapshot: StoreSnapshot =
            serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self::restore(snapshot))
    }

    /// Writes a JSON snapshot to `path`, via a temp file + rename so a crash
    /// mid-write never leaves a half-written state file. Mirrors the
    /// teacher's `KeeperState::save`.
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get_subscription(&self, id: &SubscriptionId) -> StoreResult<Option<Subscription>> {
        Ok(self.inner.lock().expect("store lock poisoned").subscriptions.get(id).cloned())
    }

    async fn put_subscription(&self, sub: Subscription) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .subscriptions
            .insert(sub.id.clone(), sub);
        Ok(())
    }

    async fn due_subscriptions(&self, now: u64, limit: usize) -> StoreResult<Vec<Subscription>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut due: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.is_eligible(now))
            .cloned()
            .collect();
        // nextRunAt ASC NULLS FIRST.
        due.sort_by_key(|s| s.next_run_at.unwrap_or(0));
        due.truncate(limit);
        Ok(due)
    }

    async fn get_run(&self, id: &RunId) -> StoreResult<Option<Run>> {
        Ok(self.inner.lock().expect("store lock poisoned").runs.get(id).cloned())
    }

    async fn put_run(&self, run: Run) -> StoreResult<()> {
        self.inner.lock().expect("store lock poisoned").runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn stale_running_runs(&self, now: u64, max_age_secs: u64) -> StoreResult<Vec<Run>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running && now.saturating_sub(r.started_at) > max_age_secs)
            .cloned()
            .collect())
    }

    async fn running_runs_without_checkpoint(&self, now: u64, min_minutes: u64) -> StoreResult<Vec<Run>> {
        let threshold = min_minutes.saturating_mul(60);
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running && r.checkpoint.is_none() && now.saturating_sub(r.started_at) > threshold)
            .cloned()
            .collect())
    }

    async fn recent_running_runs_with_checkpoint(&self, now: u64, max_age_secs: u64) -> StoreResult<Vec<Run>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running && r.checkpoint.is_some() && now.saturating_sub(r.started_at) <= max_age_secs)
            .cloned()
            .collect())
    }

    async fn get_job_match(&self, job_content_hash: &str, resume_hash: &str) -> StoreResult<Option<JobMatch>> {
        let key = (job_content_hash.to_string(), resume_hash.to_string());
        Ok(self.inner.lock().expect("store lock poisoned").job_matches.get(&key).cloned())
    }

    async fn put_job_match(&self, m: JobMatch) -> StoreResult<()> {
        let key = (m.job_content_hash.clone(), m.resume_hash.clone());
        self.inner.lock().expect("store lock poisoned").job_matches.insert(key, m);
        Ok(())
    }

    async fn recent_failed_runs(&self, limit: usize) -> StoreResult<Vec<Run>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut failed: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|r| std::cmp::Reverse(r.completed_at.unwrap_or(r.started_at)));
        failed.truncate(limit);
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriggerType;

    fn sub(id: &str, next_run_at: Option<u64>) -> Subscription {
        Subscription {
            id: id.into(),
            tenant_id: "t1".into(),
            titles: vec!["Backend Engineer".into()],
            location: None,
            resume_text: "resume".into(),
            resume_hash: "h".into(),
            min_score: 60,
            is_active: true,
            is_paused: false,
            debug_mode: false,
            created_at: 0,
            last_search_at: None,
            next_run_at,
            consecutive_failures: 0,
        }
    }

    #[tokio::test]
    async fn due_subscriptions_orders_nulls_first_then_ascending() {
        let store = InMemoryDurableStore::new();
        store.put_subscription(sub("a", Some(200))).await.unwrap();
        store.put_subscription(sub("b", None)).await.unwrap();
        store.put_subscription(sub("c", Some(100))).await.unwrap();

        let due = store.due_subscriptions(1000, 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn due_subscriptions_respects_limit() {
        let store = InMemoryDurableStore::new();
        for i in 0..10 {
            store.put_subscription(sub(&format!("s{i}"), Some(i))).await.unwrap();
        }
        let due = store.due_subscriptions(1000, 5).await.unwrap();
        assert_eq!(due.len(), 5);
    }

    #[tokio::test]
    async fn stale_running_runs_scans_by_age() {
        let store = InMemoryDurableStore::new();
        let mut r = Run::new("r1".into(), "s1".into(), TriggerType::Scheduled, 0, 1);
        r.status = RunStatus::Running;
        store.put_run(r).await.unwrap();

        let stale = store.stale_running_runs(100_000, 86_400).await.unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn recent_running_runs_with_checkpoint_finds_only_checkpointed_running_rows() {
        let store = InMemoryDurableStore::new();

        let mut checkpointed = Run::new("r-checkpointed".into(), "s1".into(), TriggerType::Scheduled, 0, 1);
        checkpointed.status = RunStatus::Running;
        checkpointed.checkpoint = Some(serde_json::json!({"stage": "matching", "percent": 40}));
        store.put_run(checkpointed).await.unwrap();

        let mut no_checkpoint = Run::new("r-no-checkpoint".into(), "s1".into(), TriggerType::Scheduled, 0, 1);
        no_checkpoint.status = RunStatus::Running;
        store.put_run(no_checkpoint).await.unwrap();

        let mut too_old = Run::new("r-too-old".into(), "s1".into(), TriggerType::Scheduled, 0, 1);
        too_old.status = RunStatus::Running;
        too_old.checkpoint = Some(serde_json::json!({"stage": "collection"}));
        too_old.started_at = 0;
        store.put_run(too_old).await.unwrap();

        let found = store.recent_running_runs_with_checkpoint(1_000, 500).await.unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["r-checkpointed".to_string()]);
    }

    #[tokio::test]
    async fn recent_failed_runs_orders_newest_first_and_ignores_other_statuses() {
        let store = InMemoryDurableStore::new();

        let mut completed = Run::new("r-ok".into(), "s1".into(), TriggerType::Scheduled, 0, 1);
        completed.status = RunStatus::Completed;
        store.put_run(completed).await.unwrap();

        let mut older_failure = Run::new("r-fail-1".into(), "s1".into(), TriggerType::Scheduled, 0, 1);
        older_failure.status = RunStatus::Failed;
        older_failure.completed_at = Some(100);
        store.put_run(older_failure).await.unwrap();

        let mut newer_failure = Run::new("r-fail-2".into(), "s1".into(), TriggerType::Scheduled, 0, 1);
        newer_failure.status = RunStatus::Failed;
        newer_failure.completed_at = Some(200);
        store.put_run(newer_failure).await.unwrap();

        let recent = store.recent_failed_runs(10).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["r-fail-2".to_string(), "r-fail-1".to_string()]);
    }

    #[tokio::test]
    async fn state_file_round_trips_through_save_and_load_or_init() {
        let dir = std::env::temp_dir().join(format!("jobsearch-engine-test-{}", std::process::id()));
        let path = dir.join("state.json");

        let store = InMemoryDurableStore::new();
        store.put_subscription(sub("s1", Some(100))).await.unwrap();
        store.put_run(Run::new("r1".into(), "s1".into(), TriggerType::Scheduled, 0, 1)).await.unwrap();
        store
            .put_job_match(JobMatch { job_content_hash: "h1".into(), resume_hash: "rh1".into(), score: 80 })
            .await
            .unwrap();

        store.save(&path).expect("save should create parent dirs and write atomically");

        let reloaded = InMemoryDurableStore::load_or_init(&path).expect("load_or_init should parse the saved snapshot");
        assert!(reloaded.get_subscription(&"s1".to_string()).await.unwrap().is_some());
        assert!(reloaded.get_run(&"r1".to_string()).await.unwrap().is_some());
        assert!(reloaded.get_job_match("h1", "rh1").await.unwrap().is_some());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_or_init_starts_empty_when_no_file_exists() {
        let path = std::env::temp_dir().join(format!("jobsearch-engine-test-missing-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        let store = InMemoryDurableStore::load_or_init(&path).expect("a missing state file is not an error");
        assert_eq!(store.snapshot().subscriptions.len(), 0);
    }
}

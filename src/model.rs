//! The durable data model: `Subscription`, `Run`, `Lock`, `CacheEntry`,
//! `KeyStat`, and `SourceState`, plus their invariants.

use serde::{Deserialize, Serialize};

pub type SubscriptionId = String;
pub type RunId = String;
pub type TenantId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub is_remote: bool,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    /// Non-empty ordered list of job-title strings.
    pub titles: Vec<String>,
    pub location: Option<Location>,
    pub resume_text: String,
    pub resume_hash: String,
    pub min_score: u8,
    pub is_active: bool,
    pub is_paused: bool,
    pub debug_mode: bool,
    pub created_at: u64,
    pub last_search_at: Option<u64>,
    pub next_run_at: Option<u64>,
    /// Feeds the scheduler's retry-delay computation
    /// (`compute_backoff_seconds`) after a failed run.
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl Subscription {
    /// A subscription is eligible iff active, not paused, and due.
    pub fn is_eligible(&self, now: u64) -> bool {
        self.is_active && !self.is_paused && self.next_run_at.map_or(true, |t| t <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collection,
    Normalization,
    Matching,
    Notification,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub current_stage: Option<Stage>,
    pub progress_percent: u8,
    pub progress_detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCounters {
    pub jobs_collected: u64,
    pub jobs_after_dedup: u64,
    pub jobs_matched: u64,
    pub notifications_sent: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    pub failed_stage: Option<Stage>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub error_context: Option<String>,
}

/// Opaque crash-recovery checkpoint payload. The engine never interprets its
/// contents beyond storing and returning it; the pipeline driver is the only
/// writer/reader.
pub type Checkpoint = serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub subscription_id: SubscriptionId,
    pub trigger_type: TriggerType,
    pub status: RunStatus,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub counters: StageCounters,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub failure: FailureContext,
    pub checkpoint: Option<Checkpoint>,
    /// Bookkeeping counter: how many times this subscription has been
    /// attempted (log correlation only, never used for correctness).
    #[serde(default)]
    pub attempt: u32,
}

impl Run {
    pub fn new(id: RunId, subscription_id: SubscriptionId, trigger_type: TriggerType, started_at: u64, attempt: u32) -> Self {
        Self {
            id,
            subscription_id,
            trigger_type,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            duration_ms: None,
            counters: StageCounters::default(),
            progress: Progress::default(),
            failure: FailureContext::default(),
            checkpoint: None,
            attempt,
        }
    }

    /// Transition into a terminal state. No-op (returns false) if already
    /// terminal: state is monotone, terminal is absorbing.
    pub fn finish(&mut self, status: RunStatus, now: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some(now.saturating_sub(self.started_at) * 1000);
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub subscription_id: SubscriptionId,
    pub holder: String,
    pub acquired_at: u64,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub inserted_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct KeyStat {
    /// Unix-second timestamps of requests within the last sliding window.
    pub timestamps: Vec<u64>,
    pub is_429_blocked: bool,
    pub blocked_until: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceState {
    pub consecutive_429s: f32,
    pub last_request_at: Option<u64>,
    pub in_cooldown: bool,
    pub cooldown_until: Option<u64>,
}

/// One posting pulled from a collection adapter, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawJob {
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub url: String,
    pub source: String,
    pub date_posted: Option<String>,
}

/// A posting after deduplication, carrying its content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedJob {
    pub raw: RawJob,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMatch {
    pub job_content_hash: String,
    pub resume_hash: String,
    pub score: u8,
}

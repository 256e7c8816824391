//! Run state machine, checkpoints, and crash-recovery scans.

use std::sync::Arc;

use crate::clock::Clock;
use crate::model::{Checkpoint, Progress, Run, RunId, RunStatus, Stage, StageCounters, SubscriptionId, TriggerType};
use crate::store::DurableStore;

pub struct RunTracker {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl RunTracker {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn start(&self, run_id: RunId, subscription_id: SubscriptionId, trigger: TriggerType, attempt: u32) -> Run {
        let run = Run::new(run_id, subscription_id, trigger, self.clock.now_unix(), attempt);
        let _ = self.store.put_run(run.clone()).await;
        run
    }

    /// Idempotent on the monotone counters: applying the same stats twice
    /// produces the same totals (callers pass running totals, not deltas).
    pub async fn update(&self, run_id: &RunId, counters: StageCounters) {
        if let Ok(Some(mut run)) = self.store.get_run(run_id).await {
            run.counters = counters;
            let _ = self.store.put_run(run).await;
        }
    }

    pub async fn checkpoint(&self, run_id: &RunId, stage: Stage, percent: u8, detail: Option<String>, opaque: Checkpoint) {
        if let Ok(Some(mut run)) = self.store.get_run(run_id).await {
            run.progress = Progress {
                current_stage: Some(stage),
                progress_percent: percent,
                progress_detail: detail,
            };
            run.checkpoint = Some(opaque);
            let _ = self.store.put_run(run).await;
        }
    }

    pub async fn complete(&self, run_id: &RunId) {
        self.transition(run_id, RunStatus::Completed, None).await;
    }

    pub async fn fail(&self, run_id: &RunId, stage: Option<Stage>, message: String) {
        if let Ok(Some(mut run)) = self.store.get_run(run_id).await {
            if run.status.is_terminal() {
                return;
            }
            run.failure.failed_stage = stage;
            run.failure.error_message = Some(message);
            let now = self.clock.now_unix();
            run.finish(RunStatus::Failed, now);
            let _ = self.store.put_run(run).await;
        }
    }

    pub async fn cancel(&self, run_id: &RunId) {
        self.transition(run_id, RunStatus::Cancelled, None).await;
    }

    async fn transition(&self, run_id: &RunId, status: RunStatus, error_context: Option<String>) {
        if let Ok(Some(mut run)) = self.store.get_run(run_id).await {
            if run.status.is_terminal() {
                return;
            }
            let now = self.clock.now_unix();
            run.finish(status, now);
            if let Some(ctx) = error_context {
                run.failure.error_context = Some(ctx);
            }
            let _ = self.store.put_run(run).await;
        }
    }

    /// Scans running rows older than `max_hours` and fails them with a
    /// synthetic `"stale"` reason.
    pub async fn fail_stale_runs(&self, max_hours: u64) -> usize {
        let now = self.clock.now_unix();
        let Ok(stale) = self.store.stale_running_runs(now, max_hours * 3600).await else {
            return 0;
        };
        let count = stale.len();
        for mut run in stale {
            run.failure.failed_stage = run.progress.current_stage;
            run.failure.error_message = Some("stale".to_string());
            run.finish(RunStatus::Failed, now);
            let _ = self.store.put_run(run).await;
        }
        count
    }

    /// Running rows with no checkpoint for `min_minutes` — used on startup
    /// to flag hung collections.
    pub async fn find_stuck_runs_without_checkpoint(&self, min_minutes: u64) -> Vec<Run> {
        let now = self.clock.now_unix();
        self.store
            .running_runs_without_checkpoint(now, min_minutes)
            .await
            .unwrap_or_default()
    }

    /// Running rows that DO have a checkpoint and are still within
    /// `max_age_hours` — a run that crashed mid-pipeline after making some
    /// progress. Used on startup alongside `find_stuck_runs_without_checkpoint`.
    pub async fn find_interrupted_runs_with_checkpoint(&self, max_age_hours: u64) -> Vec<Run> {
        let now = self.clock.now_unix();
        self.store
            .recent_running_runs_with_checkpoint(now, max_age_hours * 3600)
            .await
            .unwrap_or_default()
    }
}

//! Tick loop, cleanup loop, and startup recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::model::{Stage, StageCounters, Subscription, TriggerType};
use crate::pipeline::PipelineDriver;
use crate::run_tracker::RunTracker;
use crate::store::DurableStore;
use crate::sublock::SubLock;

const SAFETY_WINDOW_SECS: u64 = 24 * 3600;
const RETRY_DELAY_SECS: u64 = 5 * 60;
const BACKOFF_MAX_SECS: u64 = 6 * 3600;
const BACKOFF_JITTER_SECS: u64 = 60;

pub struct Scheduler {
    store: Arc<dyn DurableStore>,
    sublock: Arc<SubLock>,
    run_tracker: Arc<RunTracker>,
    pipeline: Arc<PipelineDriver>,
    clock: Arc<dyn Clock>,
    lock_ttl_secs: u64,
    job_interval_hours: u64,
    max_subscriptions_per_tick: usize,
    stale_run_max_hours: u64,
    stuck_run_min_minutes: u64,
    /// Non-reentrant guard: a tick is skipped outright if the previous one
    /// is still running.
    tick_in_progress: AtomicBool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DurableStore>,
        sublock: Arc<SubLock>,
        run_tracker: Arc<RunTracker>,
        pipeline: Arc<PipelineDriver>,
        clock: Arc<dyn Clock>,
        lock_ttl_secs: u64,
        job_interval_hours: u64,
        max_subscriptions_per_tick: usize,
        stale_run_max_hours: u64,
        stuck_run_min_minutes: u64,
    ) -> Self {
        Self {
            store,
            sublock,
            run_tracker,
            pipeline,
            clock,
            lock_ttl_secs,
            job_interval_hours,
            max_subscriptions_per_tick,
            stale_run_max_hours,
            stuck_run_min_minutes,
            tick_in_progress: AtomicBool::new(false),
        }
    }

    /// Single scheduler tick. Returns the number of subscriptions processed.
    pub async fn tick(&self) -> usize {
        if self
            .tick_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("skipping tick; prior tick still in progress");
            return 0;
        }
        let _guard = TickGuard(&self.tick_in_progress);

        let now = self.clock.now_unix();
        let due = match self.store.due_subscriptions(now, self.max_subscriptions_per_tick).await {
            Ok(due) => due,
            Err(err) => {
                tracing::error!(error = %err, "failed to query due subscriptions");
                return 0;
            }
        };

        let mut processed = 0;
        for sub in due {
            self.run_one(sub).await;
            processed += 1;
        }
        processed
    }

    async fn run_one(&self, mut sub: Subscription) {
        if !self.sublock.acquire(&sub.id, self.lock_ttl_secs).await {
            tracing::debug!(subscription_id = %sub.id, "lock held elsewhere; skipping this tick");
            return;
        }

        let now = self.clock.now_unix();
        sub.next_run_at = Some(now + SAFETY_WINDOW_SECS);
        if let Err(err) = self.store.put_subscription(sub.clone()).await {
            tracing::error!(subscription_id = %sub.id, error = %err, "failed to advance next_run_at; releasing lock");
            self.sublock.release(&sub.id).await;
            return;
        }

        let run_id = format!("{}:{}", sub.id, now);
        let attempt = sub.consecutive_failures + 1;
        let run = self.run_tracker.start(run_id.clone(), sub.id.clone(), TriggerType::Scheduled, attempt).await;

        let outcome = self.pipeline.run(&run.id, &sub).await;

        match outcome {
            Ok(result) => {
                tracing::info!(
                    subscription_id = %sub.id,
                    run_id = %run.id,
                    jobs_collected = result.jobs_collected,
                    jobs_after_dedup = result.jobs_after_dedup,
                    jobs_matched = result.jobs_matched,
                    notifications_sent = result.notifications_sent,
                    "run completed"
                );
                self.run_tracker
                    .update(
                        &run.id,
                        StageCounters {
                            jobs_collected: result.jobs_collected,
                            jobs_after_dedup: result.jobs_after_dedup,
                            jobs_matched: result.jobs_matched,
                            notifications_sent: result.notifications_sent,
                        },
                    )
                    .await;
                self.run_tracker.complete(&run.id).await;
                sub.last_search_at = Some(now);
                sub.next_run_at = Some(now + self.job_interval_hours * 3600);
                sub.consecutive_failures = 0;
            }
            Err(err) if matches!(err, crate::error::EngineError::Cancelled) => {
                tracing::info!(subscription_id = %sub.id, run_id = %run.id, "run cancelled");
                self.run_tracker.cancel(&run.id).await;
                sub.next_run_at = Some(now + RETRY_DELAY_SECS);
            }
            Err(err) => {
                sub.consecutive_failures += 1;
                let delay = compute_backoff_seconds(sub.consecutive_failures, &sub.id);
                tracing::warn!(
                    subscription_id = %sub.id,
                    run_id = %run.id,
                    error = %err,
                    consecutive_failures = sub.consecutive_failures,
                    retry_delay_secs = delay,
                    "run failed"
                );
                self.run_tracker.fail(&run.id, Some(Stage::Collection), err.to_string()).await;
                sub.next_run_at = Some(now + delay);
            }
        }

        if let Err(err) = self.store.put_subscription(sub.clone()).await {
            tracing::error!(subscription_id = %sub.id, error = %err, "failed to persist post-run subscription state");
        }
        self.sublock.release(&sub.id).await;
    }

    /// Cleanup loop, period 5 min: fail stale runs and release their locks.
    pub async fn cleanup(&self) {
        let stale_count = self.run_tracker.fail_stale_runs(self.stale_run_max_hours).await;
        if stale_count > 0 {
            tracing::info!(stale_count, "cleanup: failed stale runs");
        }
    }

    /// Startup recovery: fail stale runs, then classify any remaining
    /// running rows into two buckets — a run that crashed mid-pipeline after
    /// taking at least one checkpoint ("server_restart") and a run that
    /// never made any recorded progress ("stuck_no_progress").
    pub async fn recover_on_startup(&self) {
        let stale_count = self.run_tracker.fail_stale_runs(self.stale_run_max_hours).await;
        let interrupted = self
            .run_tracker
            .find_interrupted_runs_with_checkpoint(self.stale_run_max_hours)
            .await;
        let stuck = self.run_tracker.find_stuck_runs_without_checkpoint(self.stuck_run_min_minutes).await;

        for run in interrupted.iter().chain(stuck.iter()) {
            let reason = if run.checkpoint.is_some() { "server_restart" } else { "stuck_no_progress" };
            tracing::warn!(run_id = %run.id, subscription_id = %run.subscription_id, reason, "recovering interrupted run at startup");
            self.run_tracker.fail(&run.id, run.progress.current_stage, reason.to_string()).await;

            if let Ok(Some(mut sub)) = self.store.get_subscription(&run.subscription_id).await {
                sub.next_run_at = Some(self.clock.now_unix());
                let _ = self.store.put_subscription(sub).await;
            }
            self.sublock.release(&run.subscription_id).await;
        }

        tracing::info!(
            stale_count,
            interrupted_count = interrupted.len(),
            stuck_count = stuck.len(),
            "startup recovery complete"
        );
    }

    pub async fn run_forever(&self, tick_interval: Duration, cleanup_interval: Duration) -> ! {
        self.recover_on_startup().await;

        let mut tick_timer = tokio::time::interval(tick_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);
        loop {
            tokio::select! {
                _ = tick_timer.tick() => {
                    self.tick().await;
                }
                _ = cleanup_timer.tick() => {
                    self.cleanup().await;
                }
            }
        }
    }
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Exponential backoff with a deterministic subscription-derived jitter
/// term, clamped to `BACKOFF_MAX_SECS`.
fn compute_backoff_seconds(consecutive_failures: u32, subscription_id: &str) -> u64 {
    let base = RETRY_DELAY_SECS;
    let exp = consecutive_failures.saturating_sub(1).min(63);
    let mut backoff = base.saturating_mul(1u64 << exp).min(BACKOFF_MAX_SECS);

    let jitter_seed = subscription_id.bytes().fold(0u64, |acc, b| acc.wrapping_add(b as u64));
    if BACKOFF_JITTER_SECS > 0 {
        backoff = backoff.saturating_add(jitter_seed % BACKOFF_JITTER_SECS).min(BACKOFF_MAX_SECS);
    }
    backoff
}

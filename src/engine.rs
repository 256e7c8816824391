//! `Engine` context object: owns every long-lived component as an `Arc` and
//! wires them together once at startup, so components never import each
//! other directly. Breaks what would otherwise be a cyclic queue/worker/
//! tracker reference graph.

use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;

use crate::adapters::{CollectionAdapter, LlmAdapter, NotificationAdapter, TitleExpander};
use crate::cancellation::CancellationRegistry;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::key_pool::KeyPool;
use crate::kv::KvStore;
use crate::model::{JobMatch, RawJob, Run, RunId, Stage, StageCounters, SubscriptionId, TriggerType};
use crate::pipeline::{CollectionJob, MatchJob, PipelineDriver};
use crate::queue::{Queue, QueueStats};
use crate::rate_limiter::{RateLimiter, SourceProfile};
use crate::request_cache::RequestCache;
use crate::run_tracker::RunTracker;
use crate::scheduler::Scheduler;
use crate::store::DurableStore;
use crate::sublock::SubLock;
use crate::workers::{CollectionWorker, MatchingWorker};

pub struct Engine {
    pub store: Arc<dyn DurableStore>,
    pub kv: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub sublock: Arc<SubLock>,
    pub cancellation: Arc<CancellationRegistry>,
    pub run_tracker: Arc<RunTracker>,
    pub scheduler: Arc<Scheduler>,
    pipeline: Arc<PipelineDriver>,
}

/// Snapshot returned by the control surface's `diagnostics()` (§6): current
/// lock set, queue depths, request-cache size, and recent failures.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub held_locks: Vec<SubscriptionId>,
    pub collection_queue: QueueStats,
    pub matching_queue: QueueStats,
    pub request_cache_size: usize,
    pub recent_failures: Vec<Run>,
}

impl Engine {
    pub fn build(
        cfg: &EngineConfig,
        clock: Arc<dyn Clock>,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn DurableStore>,
        collection_adapter: Arc<dyn CollectionAdapter>,
        llm_adapter: Arc<dyn LlmAdapter>,
        notification_adapter: Arc<dyn NotificationAdapter>,
        title_expander: Option<Arc<dyn TitleExpander>>,
        holder_id: String,
    ) -> Self {
        let sublock = Arc::new(SubLock::new(kv.clone(), clock.clone(), holder_id));
        let cancellation = Arc::new(CancellationRegistry::new(kv.clone(), cfg.cancel_ttl_secs));
        let request_cache = Arc::new(RequestCache::new(clock.clone(), cfg.request_cache_ttl_ms / 1000));
        let run_tracker = Arc::new(RunTracker::new(store.clone(), clock.clone()));

        let rate_limiter = Arc::new(
            RateLimiter::new(clock.clone())
                .with_default_profile(SourceProfile {
                    base_delay_ms: cfg.collect_min_delay_ms,
                    success_delay_ms: cfg.collect_min_delay_ms,
                    ..SourceProfile::default_profile()
                })
                .with_profile(
                    "linkedin",
                    SourceProfile {
                        base_delay_ms: cfg.linkedin_delay_ms,
                        ..SourceProfile::aggressive()
                    },
                )
                .with_profile(
                    "indeed",
                    SourceProfile {
                        base_delay_ms: cfg.indeed_delay_ms,
                        ..SourceProfile::lenient()
                    },
                ),
        );
        let key_pool = Arc::new(KeyPool::new(clock.clone(), cfg.llm_api_keys.clone(), cfg.key_rpm));

        let collection_worker = Arc::new(CollectionWorker {
            adapter: collection_adapter,
            rate_limiter,
            cancellation: cancellation.clone(),
        });
        let collection_queue: Queue<CollectionJob, Vec<RawJob>> = Queue::new(
            clock.clone(),
            cfg.queue_collect_concurrency,
            Arc::new(move |job: CollectionJob| {
                let worker = collection_worker.clone();
                async move { worker.collect(&job.run_id, job.request).await }.boxed()
            }),
        );

        let matching_worker = Arc::new(MatchingWorker {
            adapter: llm_adapter,
            key_pool,
            cancellation: cancellation.clone(),
            store: store.clone(),
        });
        let matching_queue: Queue<MatchJob, JobMatch> = Queue::new(
            clock.clone(),
            cfg.queue_llm_concurrency,
            Arc::new(move |job: MatchJob| {
                let worker = matching_worker.clone();
                async move { worker.score(&job.run_id, &job.job, &job.resume_text).await }.boxed()
            }),
        );

        let pipeline = Arc::new(PipelineDriver {
            run_tracker: run_tracker.clone(),
            cancellation: cancellation.clone(),
            request_cache,
            collection_queue,
            matching_queue,
            notification: notification_adapter,
            title_expander,
            max_queries_per_run: cfg.max_queries_per_run,
            collect_concurrency: cfg.queue_collect_concurrency,
            match_concurrency: cfg.queue_llm_concurrency,
        });

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            sublock.clone(),
            run_tracker.clone(),
            pipeline.clone(),
            clock.clone(),
            cfg.lock_ttl_secs,
            cfg.job_interval_hours,
            cfg.max_subscriptions_per_tick,
            cfg.stale_run_max_hours,
            cfg.stuck_run_min_minutes,
        ));

        Self {
            store,
            kv,
            clock,
            sublock,
            cancellation,
            run_tracker,
            scheduler,
            pipeline,
        }
    }
}

/// Administrative surface: a chat bot or admin dashboard sits on top of
/// this, but the engine owns the actual state transitions.
#[async_trait]
pub trait ControlSurface: Send + Sync {
    async fn start_run(&self, subscription_id: &SubscriptionId) -> Option<RunId>;
    async fn stop_run(&self, run_id: &RunId);
    async fn fail_stuck_runs(&self, min_age_minutes: u64) -> usize;
    async fn diagnostics(&self) -> Diagnostics;
}

#[async_trait]
impl ControlSurface for Engine {
    async fn start_run(&self, subscription_id: &SubscriptionId) -> Option<RunId> {
        let sub = self.store.get_subscription(subscription_id).await.ok().flatten()?;
        if !self.sublock.acquire(subscription_id, 60).await {
            return None;
        }

        let now = self.clock.now_unix();
        let run_id = format!("manual:{}:{}", sub.id, now);
        let attempt = sub.consecutive_failures + 1;
        let run = self.run_tracker.start(run_id, sub.id.clone(), TriggerType::Manual, attempt).await;

        // Launch and await the pipeline before releasing the lock, the same
        // acquire-run-release shape as the scheduled tick path
        // (scheduler.rs's `run_one`).
        let outcome = self.pipeline.run(&run.id, &sub).await;
        let mut sub = sub;
        match outcome {
            Ok(result) => {
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
                sub.consecutive_failures = 0;
            }
            Err(err) if matches!(err, crate::error::EngineError::Cancelled) => {
                self.run_tracker.cancel(&run.id).await;
            }
            Err(err) => {
                sub.consecutive_failures += 1;
                self.run_tracker.fail(&run.id, Some(Stage::Collection), err.to_string()).await;
            }
        }
        if let Err(err) = self.store.put_subscription(sub).await {
            tracing::error!(subscription_id = %subscription_id, error = %err, "failed to persist post-run subscription state");
        }

        self.sublock.release(subscription_id).await;
        Some(run.id)
    }

    async fn stop_run(&self, run_id: &RunId) {
        self.cancellation.mark_cancelled(run_id).await;
    }

    async fn fail_stuck_runs(&self, min_age_minutes: u64) -> usize {
        self.run_tracker.fail_stale_runs(min_age_minutes / 60).await
    }

    async fn diagnostics(&self) -> Diagnostics {
        let recent_failures = self.store.recent_failed_runs(20).await.unwrap_or_default();
        Diagnostics {
            held_locks: self.sublock.held_locks(),
            collection_queue: self.pipeline.collection_queue.stats(),
            matching_queue: self.pipeline.matching_queue.stats(),
            request_cache_size: self.pipeline.request_cache.len(),
            recent_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::{Args, EngineConfig};
    use crate::kv::InMemoryKvStore;
    use crate::model::{Location, Subscription};
    use crate::store::InMemoryDurableStore;
    use crate::testing::{FakeCollectionAdapter, FakeLlmAdapter, FakeNotificationAdapter};

    fn test_config() -> EngineConfig {
        EngineConfig::from_cli_and_env(Args {
            tick_interval_seconds: 60,
            cleanup_interval_seconds: 300,
            max_subscriptions_per_tick: 5,
            job_interval_hours: 1,
            queue_collect_concurrency: 2,
            queue_llm_concurrency: 2,
            llm_api_keys: Some("key-a,key-b".into()),
            key_rpm: 20,
            collect_min_delay_ms: 0,
            linkedin_delay_ms: 0,
            indeed_delay_ms: 0,
            max_queries_per_run: 100,
            lock_ttl_secs: 7_200,
            cancel_ttl_secs: 86_400,
            request_cache_ttl_ms: 300_000,
            stale_run_max_hours: 6,
            stuck_run_min_minutes: 15,
            once: false,
            state_file: None,
        })
        .unwrap()
    }

    fn subscription(id: &str) -> Subscription {
        Subscription {
            id: id.into(),
            tenant_id: "tenant-1".into(),
            titles: vec!["Backend Engineer".into()],
            location: Some(Location { is_remote: true, country: None }),
            resume_text: "x".repeat(500),
            resume_hash: "h".into(),
            min_score: 60,
            is_active: true,
            is_paused: false,
            debug_mode: false,
            created_at: 0,
            last_search_at: None,
            next_run_at: None,
            consecutive_failures: 0,
        }
    }

    fn raw_job(title: &str) -> RawJob {
        RawJob {
            title: title.into(),
            company: "Acme".into(),
            location: "Remote".into(),
            description: "".into(),
            url: "https://example.com/job".into(),
            source: "linkedin".into(),
            date_posted: None,
        }
    }

    /// Scenario 1: happy path, single subscription.
    #[tokio::test]
    async fn happy_path_single_subscription_completes_and_reschedules() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000_000));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new(clock.clone()));
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
        let cfg = test_config();

        let sub = subscription("sub-1");
        store.put_subscription(sub.clone()).await.unwrap();

        let engine = Engine::build(
            &cfg,
            clock.clone(),
            kv,
            store.clone(),
            Arc::new(FakeCollectionAdapter::with_jobs(vec![raw_job("Backend Engineer")])),
            Arc::new(FakeLlmAdapter::fixed_score(75)),
            Arc::new(FakeNotificationAdapter::default()),
            None,
            "worker-a".into(),
        );

        let processed = engine.scheduler.tick().await;
        assert_eq!(processed, 1);

        let updated = store.get_subscription(&sub.id).await.unwrap().unwrap();
        assert!(updated.last_search_at.is_some());
        let expected_next = updated.last_search_at.unwrap() + cfg.job_interval_hours * 3600;
        assert_eq!(updated.next_run_at, Some(expected_next));

        // A completed tick must not leave any lock held, and the request
        // cache should carry the coalesced collection query it just ran.
        let diagnostics = engine.diagnostics().await;
        assert!(diagnostics.held_locks.is_empty());
        assert_eq!(diagnostics.request_cache_size, 2, "one entry per (title, source) query issued");

        // The run's persisted stage counters must reflect the pipeline's
        // actual outcome, not stay at their zero default.
        let stored_run = store
            .get_run(&format!("{}:{}", sub.id, 1_000_000))
            .await
            .unwrap()
            .expect("run was started at the tick's observed `now`");
        assert_eq!(stored_run.counters.jobs_collected, 1);
        assert_eq!(stored_run.counters.jobs_matched, 1);
        assert_eq!(stored_run.counters.notifications_sent, 1);
    }

    /// Scenario 2: two subscriptions issuing the same query within the
    /// cache TTL coalesce into a single adapter call.
    #[tokio::test]
    async fn two_subscriptions_same_query_coalesce_into_one_adapter_call() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000_000));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new(clock.clone()));
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
        let cfg = test_config();

        let sub_a = subscription("sub-a");
        let sub_b = subscription("sub-b");
        store.put_subscription(sub_a.clone()).await.unwrap();
        store.put_subscription(sub_b.clone()).await.unwrap();

        let adapter = Arc::new(FakeCollectionAdapter::with_jobs(vec![raw_job("Backend Engineer")]));
        let engine = Engine::build(
            &cfg,
            clock.clone(),
            kv,
            store.clone(),
            adapter.clone(),
            Arc::new(FakeLlmAdapter::fixed_score(75)),
            Arc::new(FakeNotificationAdapter::default()),
            None,
            "worker-a".into(),
        );

        // Both subscriptions are due in the same tick; they are handled
        // sequentially within one scheduler but exercise the same shared
        // request cache, so the adapter is still hit only once.
        engine.scheduler.tick().await;

        let updated_a = store.get_subscription(&sub_a.id).await.unwrap().unwrap();
        let updated_b = store.get_subscription(&sub_b.id).await.unwrap().unwrap();
        assert!(updated_a.last_search_at.is_some());
        assert!(updated_b.last_search_at.is_some());
        assert_eq!(adapter.call_count(), 1, "identical queries within the cache TTL must coalesce");
    }

    /// Scenario 3: a 429 storm on one source forces a cooldown while the
    /// other source keeps working.
    #[tokio::test]
    async fn rate_limiter_cooldown_blocks_only_the_offending_source() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000_000));
        let limiter = RateLimiter::new(clock.clone());
        for _ in 0..3 {
            limiter.record_429("linkedin");
        }

        let linkedin_delay = limiter.get_required_delay("linkedin");
        assert!(linkedin_delay.as_secs() > 0, "linkedin must be in cooldown after 3 consecutive 429s");

        let indeed_delay = limiter.get_required_delay("indeed");
        assert!(indeed_delay.as_secs() < linkedin_delay.as_secs(), "indeed must be unaffected by linkedin's cooldown");
    }

    /// Scenario 5: cancelling mid-matching lets the in-flight match finish
    /// but skips everything still queued, and no notification is sent for
    /// the skipped postings.
    #[tokio::test]
    async fn cancel_in_flight_stops_before_notification() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000_000));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new(clock.clone()));
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
        let cancellation = Arc::new(CancellationRegistry::new(kv, 86_400));
        let run_tracker = Arc::new(RunTracker::new(store.clone(), clock.clone()));

        let run_id = "run-cancel".to_string();
        let sub = subscription("sub-cancel");
        let run = run_tracker.start(run_id.clone(), sub.id.clone(), crate::model::TriggerType::Scheduled, 1).await;

        let notification = Arc::new(FakeNotificationAdapter::default());

        // Cancel before the pipeline even starts collecting: every stage
        // boundary must observe it and stop without sending anything.
        cancellation.mark_cancelled(&run.id).await;

        let driver = PipelineDriver {
            run_tracker: run_tracker.clone(),
            cancellation: cancellation.clone(),
            request_cache: Arc::new(RequestCache::new(clock.clone(), 300)),
            collection_queue: Queue::new(
                clock.clone(),
                1,
                Arc::new(|_job: CollectionJob| async { Ok::<Vec<RawJob>, crate::error::EngineError>(vec![]) }.boxed()),
            ),
            matching_queue: Queue::new(
                clock.clone(),
                1,
                Arc::new(|_job: MatchJob| {
                    async { Err::<JobMatch, _>(crate::error::EngineError::Transient("should never be called".into())) }.boxed()
                }),
            ),
            notification: notification.clone(),
            title_expander: None,
            max_queries_per_run: 10,
            collect_concurrency: 1,
            match_concurrency: 1,
        };

        let result = driver.run(&run.id, &sub).await;
        assert!(matches!(result, Err(crate::error::EngineError::Cancelled)));
        assert_eq!(notification.sent_idempotency_keys().len(), 0);
    }

    /// `ControlSurface::start_run` must actually launch the pipeline (spec
    /// §6: "acquire lock, launch pipeline, return runId"), not just create a
    /// `Running` row that nothing ever finishes.
    #[tokio::test]
    async fn manual_start_run_actually_runs_the_pipeline() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000_000));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new(clock.clone()));
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
        let cfg = test_config();

        let sub = subscription("sub-manual");
        store.put_subscription(sub.clone()).await.unwrap();

        let engine = Engine::build(
            &cfg,
            clock.clone(),
            kv,
            store.clone(),
            Arc::new(FakeCollectionAdapter::with_jobs(vec![raw_job("Backend Engineer")])),
            Arc::new(FakeLlmAdapter::fixed_score(75)),
            Arc::new(FakeNotificationAdapter::default()),
            None,
            "worker-a".into(),
        );

        let run_id = engine.start_run(&sub.id).await.expect("lock is free; start_run must return a run id");

        let stored_run = store.get_run(&run_id).await.unwrap().expect("start_run must persist the run it launched");
        assert_eq!(stored_run.status, crate::model::RunStatus::Completed, "the pipeline must have actually run to completion");
        assert_eq!(stored_run.counters.jobs_collected, 1);
        assert_eq!(stored_run.counters.jobs_matched, 1);
        assert_eq!(stored_run.counters.notifications_sent, 1);

        // The lock must be released afterwards so a subsequent call isn't
        // spuriously rejected.
        assert!(engine.diagnostics().await.held_locks.is_empty());

        let updated = store.get_subscription(&sub.id).await.unwrap().unwrap();
        assert!(updated.last_search_at.is_some());
    }

    /// Scenario 4: a process crashes after checkpointing mid-run. On
    /// restart, `recover_on_startup` must find the checkpointed `Running`
    /// row, fail it with reason `"server_restart"`, release its lock, and
    /// reset `nextRunAt` to now so the next tick starts a fresh run.
    #[tokio::test]
    async fn startup_recovery_fails_checkpointed_run_as_server_restart() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(1_000_000));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new(clock.clone()));
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
        let cfg = test_config();

        let mut sub = subscription("sub-crashed");
        sub.next_run_at = Some(2_000_000);
        store.put_subscription(sub.clone()).await.unwrap();

        // A run that crashed after checkpointing `stage=matching, percent=40`,
        // shortly before "now" — well within the staleness window.
        let mut crashed_run = Run::new("run-crashed".into(), sub.id.clone(), crate::model::TriggerType::Scheduled, 999_900, 1);
        crashed_run.checkpoint = Some(serde_json::json!({"stage": "matching", "percent": 40}));
        crashed_run.progress.current_stage = Some(Stage::Matching);
        store.put_run(crashed_run).await.unwrap();
        assert!(engine_sublock_acquire(&kv, &clock, &sub.id).await);

        let engine = Engine::build(
            &cfg,
            clock.clone(),
            kv,
            store.clone(),
            Arc::new(FakeCollectionAdapter::with_jobs(vec![])),
            Arc::new(FakeLlmAdapter::fixed_score(0)),
            Arc::new(FakeNotificationAdapter::default()),
            None,
            "worker-a".into(),
        );

        engine.scheduler.recover_on_startup().await;

        let recovered = store.get_run(&"run-crashed".to_string()).await.unwrap().unwrap();
        assert_eq!(recovered.status, crate::model::RunStatus::Failed);
        assert_eq!(recovered.failure.error_message.as_deref(), Some("server_restart"));

        let updated_sub = store.get_subscription(&sub.id).await.unwrap().unwrap();
        assert_eq!(updated_sub.next_run_at, Some(1_000_000), "next_run_at must reset to now so the next tick retries immediately");

        assert!(
            !engine.sublock.is_held(&sub.id).await,
            "the crashed run's lock must be released in the kv store, even though a different SubLock instance acquired it"
        );
    }

    /// Simulates the pre-crash `SubLock::acquire` that the scheduler would
    /// have held for the subscription, so recovery has a lock to release.
    async fn engine_sublock_acquire(kv: &Arc<dyn KvStore>, clock: &Arc<dyn Clock>, subscription_id: &SubscriptionId) -> bool {
        let sublock = SubLock::new(kv.clone(), clock.clone(), "worker-a".into());
        sublock.acquire(subscription_id, 7_200).await
    }
}

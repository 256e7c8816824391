use clap::Parser;
use eyre::Result;
use std::sync::Arc;

use jobsearch_engine::clock::{Clock, SystemClock};
use jobsearch_engine::config::{Args, EngineConfig};
use jobsearch_engine::engine::Engine;
use jobsearch_engine::kv::{InMemoryKvStore, KvStore};
use jobsearch_engine::store::{DurableStore, InMemoryDurableStore};

/// Placeholder adapters until real job-board, LLM, and notification
/// integrations are wired in — all three are out of scope for this crate;
/// only their contracts are modeled.
mod stub_adapters {
    use async_trait::async_trait;
    use jobsearch_engine::adapters::{CollectionAdapter, CollectionRequest, LlmAdapter, LlmCallError, LlmRequest, NotificationAdapter, NotificationPayload};
    use jobsearch_engine::model::RawJob;

    pub struct NoopCollectionAdapter;
    #[async_trait]
    impl CollectionAdapter for NoopCollectionAdapter {
        async fn collect(&self, _request: CollectionRequest) -> Result<Vec<RawJob>, String> {
            Ok(Vec::new())
        }
    }

    pub struct NoopLlmAdapter;
    #[async_trait]
    impl LlmAdapter for NoopLlmAdapter {
        async fn score(&self, _request: LlmRequest, _api_key: &str) -> Result<u8, LlmCallError> {
            Ok(0)
        }
    }

    pub struct NoopNotificationAdapter;
    #[async_trait]
    impl NotificationAdapter for NoopNotificationAdapter {
        async fn send(&self, _chat_id: &str, _payload: NotificationPayload, _idempotency_key: &str) -> Result<(), String> {
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = EngineConfig::from_cli_and_env(args)?;

    let holder_id = std::env::var("HOSTNAME").unwrap_or_else(|_| format!("worker-{}", std::process::id()));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new(clock.clone()));

    let in_memory_store = match &cfg.state_file {
        Some(path) => InMemoryDurableStore::load_or_init(path)?,
        None => InMemoryDurableStore::new(),
    };
    let in_memory_store = Arc::new(in_memory_store);
    let store: Arc<dyn DurableStore> = in_memory_store.clone();

    let engine = Engine::build(
        &cfg,
        clock,
        kv,
        store,
        Arc::new(stub_adapters::NoopCollectionAdapter),
        Arc::new(stub_adapters::NoopLlmAdapter),
        Arc::new(stub_adapters::NoopNotificationAdapter),
        None,
        holder_id.clone(),
    );

    tracing::info!(
        holder_id,
        tick_interval_secs = cfg.tick_interval.as_secs(),
        cleanup_interval_secs = cfg.cleanup_interval.as_secs(),
        queue_collect_concurrency = cfg.queue_collect_concurrency,
        queue_llm_concurrency = cfg.queue_llm_concurrency,
        "engine starting"
    );

    if cfg.once {
        engine.scheduler.recover_on_startup().await;
        engine.scheduler.tick().await;
        engine.scheduler.cleanup().await;
        save_state(&in_memory_store, &cfg.state_file);
        return Ok(());
    }

    if cfg.state_file.is_none() {
        return engine.scheduler.run_forever(cfg.tick_interval, cfg.cleanup_interval).await;
    }

    // With a state file configured, run our own tick/cleanup loop so we can
    // persist after each pass; `Scheduler::run_forever` has no filesystem
    // concerns of its own.
    engine.scheduler.recover_on_startup().await;
    save_state(&in_memory_store, &cfg.state_file);

    let mut tick_timer = tokio::time::interval(cfg.tick_interval);
    let mut cleanup_timer = tokio::time::interval(cfg.cleanup_interval);
    loop {
        tokio::select! {
            _ = tick_timer.tick() => {
                engine.scheduler.tick().await;
                save_state(&in_memory_store, &cfg.state_file);
            }
            _ = cleanup_timer.tick() => {
                engine.scheduler.cleanup().await;
                save_state(&in_memory_store, &cfg.state_file);
            }
        }
    }
}

/// Persists the durable store to `state_file` if one is configured. A save
/// failure is logged and otherwise ignored: the in-memory state remains
/// authoritative for this process, and the next successful save catches up.
fn save_state(store: &InMemoryDurableStore, state_file: &Option<std::path::PathBuf>) {
    if let Some(path) = state_file {
        if let Err(err) = store.save(path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to persist state file");
        }
    }
}

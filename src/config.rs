//! Engine configuration: CLI flags layered over environment variables,
//! warn-and-clamp where a value is merely unwise, hard-fail where it would
//! make the engine unable to run at all.

use clap::Parser;
use eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "jobsearch-engine", version, about = "Multi-tenant job-search pipeline execution engine")]
pub struct Args {
    /// Scheduler tick period, in seconds.
    #[arg(long, default_value_t = 60)]
    pub tick_interval_seconds: u64,

    /// Stale-run / checkpoint cleanup period, in seconds.
    #[arg(long, default_value_t = 300)]
    pub cleanup_interval_seconds: u64,

    /// How many due subscriptions the scheduler pulls per tick.
    #[arg(long, default_value_t = 5)]
    pub max_subscriptions_per_tick: usize,

    /// Re-run cadence for a subscription, in hours.
    #[arg(long, default_value_t = 1)]
    pub job_interval_hours: u64,

    /// Concurrent collection-queue workers.
    #[arg(long, default_value_t = 2)]
    pub queue_collect_concurrency: usize,

    /// Concurrent matching-queue workers.
    #[arg(long, default_value_t = 5)]
    pub queue_llm_concurrency: usize,

    /// Comma-separated LLM API keys. Falls back to `LLM_API_KEYS` env var.
    #[arg(long)]
    pub llm_api_keys: Option<String>,

    /// Requests per key per 60s sliding window.
    #[arg(long, default_value_t = 10)]
    pub key_rpm: usize,

    /// Minimum delay, in ms, between collection requests to any source
    /// without its own named profile.
    #[arg(long, default_value_t = 1_500)]
    pub collect_min_delay_ms: u64,

    #[arg(long, default_value_t = 3_000)]
    pub linkedin_delay_ms: u64,

    #[arg(long, default_value_t = 1_000)]
    pub indeed_delay_ms: u64,

    /// Max search-title queries a single run issues in total.
    #[arg(long, default_value_t = 100)]
    pub max_queries_per_run: u32,

    /// SubLock TTL, in seconds.
    #[arg(long, default_value_t = 7_200)]
    pub lock_ttl_secs: u64,

    /// Cancellation-registry entry TTL, in seconds.
    #[arg(long, default_value_t = 3_600)]
    pub cancel_ttl_secs: u64,

    /// In-flight request cache TTL, in ms.
    #[arg(long, default_value_t = 300_000)]
    pub request_cache_ttl_ms: u64,

    /// Hours a `Running` run can persist before `failStaleRuns` kills it.
    #[arg(long, default_value_t = 24)]
    pub stale_run_max_hours: u64,

    /// Minutes a `Running`, checkpoint-less run is considered stuck at startup.
    #[arg(long, default_value_t = 10)]
    pub stuck_run_min_minutes: u64,

    /// Run the reconciliation/recovery pass once and exit, skipping the tick loop.
    #[arg(long)]
    pub once: bool,

    /// Optional JSON file backing the in-memory durable store: loaded on
    /// startup, saved after every tick/cleanup pass. Falls back to a pure
    /// in-memory store (state lost on restart) when omitted.
    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub cleanup_interval: Duration,
    pub max_subscriptions_per_tick: usize,
    pub job_interval_hours: u64,
    pub queue_collect_concurrency: usize,
    pub queue_llm_concurrency: usize,
    pub llm_api_keys: Vec<String>,
    pub key_rpm: usize,
    pub collect_min_delay_ms: u64,
    pub linkedin_delay_ms: u64,
    pub indeed_delay_ms: u64,
    pub max_queries_per_run: u32,
    pub lock_ttl_secs: u64,
    pub cancel_ttl_secs: u64,
    pub request_cache_ttl_ms: u64,
    pub stale_run_max_hours: u64,
    pub stuck_run_min_minutes: u64,
    pub once: bool,
    pub state_file: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_cli_and_env(args: Args) -> Result<Self> {
        let keys_raw = args
            .llm_api_keys
            .or_else(|| std::env::var("LLM_API_KEYS").ok())
            .ok_or_else(|| eyre!("no LLM API keys provided. Pass --llm-api-keys or set LLM_API_KEYS"))?;

        let llm_api_keys: Vec<String> = keys_raw
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        if llm_api_keys.is_empty() {
            return Err(eyre!("LLM_API_KEYS resolved to an empty key list"));
        }

        if args.queue_collect_concurrency == 0 || args.queue_llm_concurrency == 0 {
            return Err(eyre!("queue concurrency settings must be > 0"));
        }
        if args.max_subscriptions_per_tick == 0 {
            return Err(eyre!("max subscriptions per tick must be > 0"));
        }

        if args.stuck_run_min_minutes * 60 > args.stale_run_max_hours * 3600 {
            tracing::warn!(
                stuck_run_min_minutes = args.stuck_run_min_minutes,
                stale_run_max_hours = args.stale_run_max_hours,
                "stuck-run threshold exceeds stale-run threshold; stale runs will be killed before ever being reported stuck"
            );
        }

        Ok(Self {
            tick_interval: Duration::from_secs(args.tick_interval_seconds.max(1)),
            cleanup_interval: Duration::from_secs(args.cleanup_interval_seconds.max(1)),
            max_subscriptions_per_tick: args.max_subscriptions_per_tick,
            job_interval_hours: args.job_interval_hours.max(1),
            queue_collect_concurrency: args.queue_collect_concurrency,
            queue_llm_concurrency: args.queue_llm_concurrency,
            llm_api_keys,
            key_rpm: args.key_rpm.max(1),
            collect_min_delay_ms: args.collect_min_delay_ms,
            linkedin_delay_ms: args.linkedin_delay_ms,
            indeed_delay_ms: args.indeed_delay_ms,
            max_queries_per_run: args.max_queries_per_run.max(1),
            lock_ttl_secs: args.lock_ttl_secs.max(60),
            cancel_ttl_secs: args.cancel_ttl_secs.max(60),
            request_cache_ttl_ms: args.request_cache_ttl_ms,
            stale_run_max_hours: args.stale_run_max_hours.max(1),
            stuck_run_min_minutes: args.stuck_run_min_minutes.max(1),
            once: args.once,
            state_file: args.state_file,
        })
    }
}

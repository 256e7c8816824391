//! Per-subscription pipeline driver: Expand → Collect → Normalize → Match →
//! Filter & notify, checkpointing and polling for cancellation at every
//! stage boundary.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::adapters::{CollectionRequest, NotificationAdapter, NotificationPayload, TitleExpander};
use crate::cancellation::CancellationRegistry;
use crate::error::EngineError;
use crate::hash::{cache_key, content_hash, idempotency_key, CollectionParams};
use crate::model::{JobMatch, NormalizedJob, RawJob, RunId, Stage, Subscription};
use crate::queue::{EnqueueOpts, Queue};
use crate::request_cache::RequestCache;
use crate::run_tracker::RunTracker;

const DEFAULT_MAX_EXPANDED_TITLES: usize = 25;
const DEFAULT_MAX_RESUME_DERIVED_TITLES: usize = 10;
const SOURCES: [&str; 2] = ["linkedin", "indeed"];

/// Jobs carried on the collection queue.
#[derive(Clone)]
pub struct CollectionJob {
    pub run_id: RunId,
    pub request: CollectionRequest,
}

/// Jobs carried on the matching queue.
#[derive(Clone)]
pub struct MatchJob {
    pub run_id: RunId,
    pub job: NormalizedJob,
    pub resume_text: String,
}

pub struct PipelineOutcome {
    pub jobs_collected: u64,
    pub jobs_after_dedup: u64,
    pub jobs_matched: u64,
    pub notifications_sent: u64,
}

pub struct PipelineDriver {
    pub run_tracker: Arc<RunTracker>,
    pub cancellation: Arc<CancellationRegistry>,
    pub request_cache: Arc<RequestCache<Vec<RawJob>>>,
    pub collection_queue: Queue<CollectionJob, Vec<RawJob>>,
    pub matching_queue: Queue<MatchJob, JobMatch>,
    pub notification: Arc<dyn NotificationAdapter>,
    pub title_expander: Option<Arc<dyn TitleExpander>>,
    pub max_queries_per_run: u32,
    /// How many collection queries this run fans out at once. Mirrors
    /// `QUEUE_COLLECT_CONCURRENCY`, so a single run's own throughput actually
    /// uses the configured worker pool instead of draining it one job at a
    /// time.
    pub collect_concurrency: usize,
    /// How many match jobs this run fans out at once, mirroring
    /// `QUEUE_LLM_CONCURRENCY`.
    pub match_concurrency: usize,
}

impl PipelineDriver {
    pub async fn run(&self, run_id: &RunId, sub: &Subscription) -> Result<PipelineOutcome, EngineError> {
        if self.cancelled(run_id).await {
            return Err(EngineError::Cancelled);
        }

        let titles = self.expand_titles(sub).await;
        self.run_tracker
            .checkpoint(run_id, Stage::Collection, 5, Some(format!("{} titles", titles.len())), serde_json::json!({"titles": titles}))
            .await;

        if self.cancelled(run_id).await {
            return Err(EngineError::Cancelled);
        }

        let raw_jobs = self.collect(run_id, sub, &titles).await;
        let jobs_collected = raw_jobs.len() as u64;
        self.run_tracker
            .checkpoint(run_id, Stage::Normalization, 40, Some(format!("{jobs_collected} raw postings")), serde_json::json!({}))
            .await;

        if self.cancelled(run_id).await {
            return Err(EngineError::Cancelled);
        }

        let normalized = normalize_and_dedup(raw_jobs, sub);
        let jobs_after_dedup = normalized.len() as u64;
        let jobs_by_hash: HashMap<String, NormalizedJob> =
            normalized.iter().map(|j| (j.content_hash.clone(), j.clone())).collect();
        self.run_tracker
            .checkpoint(run_id, Stage::Matching, 60, Some(format!("{jobs_after_dedup} unique postings")), serde_json::json!({}))
            .await;

        if self.cancelled(run_id).await {
            return Err(EngineError::Cancelled);
        }

        let matches = self.match_jobs(run_id, sub, normalized).await;
        let jobs_matched = matches.len() as u64;
        self.run_tracker
            .checkpoint(run_id, Stage::Notification, 85, Some(format!("{jobs_matched} scored")), serde_json::json!({}))
            .await;

        if self.cancelled(run_id).await {
            return Err(EngineError::Cancelled);
        }

        let notifications_sent = self.filter_and_notify(sub, matches, &jobs_by_hash).await;

        Ok(PipelineOutcome {
            jobs_collected,
            jobs_after_dedup,
            jobs_matched,
            notifications_sent,
        })
    }

    async fn cancelled(&self, run_id: &RunId) -> bool {
        self.cancellation.is_cancelled(run_id).await
    }

    /// Stage 1: bounded, optional title expansion via the LLM.
    async fn expand_titles(&self, sub: &Subscription) -> Vec<String> {
        let mut titles = sub.titles.clone();
        titles.truncate(DEFAULT_MAX_EXPANDED_TITLES);

        if let Some(expander) = &self.title_expander {
            match expander.expand(&sub.resume_text, &titles, DEFAULT_MAX_RESUME_DERIVED_TITLES).await {
                Ok(extra) => titles.extend(extra),
                Err(err) => {
                    tracing::warn!(subscription_id = %sub.id, error = %err, "title expansion failed; continuing with declared titles only");
                }
            }
        }
        titles
    }

    /// Stage 2: one collection job per (title, source), deduplicated through
    /// the in-flight request cache, bounded by `max_queries_per_run`, with
    /// per-query failures downgraded to a warning — partial collection from
    /// some sources beats failing the whole run. Queries fan out up to
    /// `collect_concurrency` at once via `for_each_concurrent`, the same
    /// combinator the teacher's `collect_due` drives its own fan-out with.
    async fn collect(&self, run_id: &RunId, sub: &Subscription, titles: &[String]) -> Vec<RawJob> {
        let mut queries: Vec<(String, &'static str)> = Vec::new();
        'outer: for title in titles {
            for source in SOURCES {
                if queries.len() as u32 >= self.max_queries_per_run {
                    tracing::warn!(subscription_id = %sub.id, max = self.max_queries_per_run, "max queries per run reached; stopping collection early");
                    break 'outer;
                }
                queries.push((title.clone(), source));
            }
        }

        let jobs = Arc::new(AsyncMutex::new(Vec::new()));
        let location = sub.location.as_ref().and_then(|l| l.country.clone());
        let is_remote = sub.location.as_ref().map(|l| l.is_remote);
        let request_cache = self.request_cache.clone();

        stream::iter(queries)
            .for_each_concurrent(self.collect_concurrency.max(1), move |(title, source)| {
                let jobs = jobs.clone();
                let location = location.clone();
                let subscription_id = sub.id.clone();
                let run_id = run_id.clone();
                let collection_queue = self.collection_queue.clone();
                let request_cache = request_cache.clone();
                async move {
                    let params = CollectionParams {
                        query: &title,
                        location: location.as_deref(),
                        is_remote,
                        job_type: None,
                        date_posted: None,
                        source,
                        limit: 25,
                    };
                    let key = cache_key(&params);

                    let request = CollectionRequest {
                        query: title.clone(),
                        location: location.clone(),
                        is_remote,
                        job_type: None,
                        date_posted: None,
                        source: source.to_string(),
                        limit: 25,
                        skip_cache: false,
                    };

                    let fetch = request_cache.get_or_insert_with(&key, false, move || async move {
                        let handle = collection_queue.enqueue(CollectionJob { run_id, request }, EnqueueOpts::default());
                        handle.finished().await
                    });

                    match fetch.await {
                        Ok(found) => jobs.lock().await.extend(found),
                        Err(err) => {
                            tracing::warn!(subscription_id = %subscription_id, title = %title, source, error = %err, "collection query failed; continuing");
                        }
                    }
                }
            })
            .await;

        Arc::try_unwrap(jobs).expect("all collection tasks finished before for_each_concurrent returned").into_inner()
    }

    /// Stage 4: one matching job per deduplicated posting, fanned out up to
    /// `match_concurrency` at once.
    async fn match_jobs(&self, run_id: &RunId, sub: &Subscription, jobs: Vec<NormalizedJob>) -> Vec<JobMatch> {
        let matches = Arc::new(AsyncMutex::new(Vec::with_capacity(jobs.len())));
        let subscription_id = sub.id.clone();
        let resume_text = sub.resume_text.clone();

        stream::iter(jobs)
            .for_each_concurrent(self.match_concurrency.max(1), |job| {
                let matches = matches.clone();
                let subscription_id = subscription_id.clone();
                let resume_text = resume_text.clone();
                let run_id = run_id.clone();
                let handle = self.matching_queue.enqueue(
                    MatchJob {
                        run_id,
                        job,
                        resume_text,
                    },
                    EnqueueOpts::default(),
                );
                async move {
                    match handle.finished().await {
                        Ok(m) => matches.lock().await.push(m),
                        Err(err) => {
                            tracing::warn!(subscription_id = %subscription_id, error = %err, "match job failed; skipping posting");
                        }
                    }
                }
            })
            .await;

        Arc::try_unwrap(matches).expect("all match tasks finished before for_each_concurrent returned").into_inner()
    }

    /// Stage 5: threshold filter, then at-least-once delivery with an
    /// idempotency key so retried notifications never duplicate a send.
    async fn filter_and_notify(
        &self,
        sub: &Subscription,
        matches: Vec<JobMatch>,
        jobs_by_hash: &HashMap<String, NormalizedJob>,
    ) -> u64 {
        let mut sent = 0u64;
        for m in matches {
            if m.score < sub.min_score {
                continue;
            }
            let Some(job) = jobs_by_hash.get(&m.job_content_hash) else {
                tracing::warn!(subscription_id = %sub.id, content_hash = %m.job_content_hash, "matched job missing from dedup map; skipping notification");
                continue;
            };
            let key = idempotency_key(&sub.id, &m.job_content_hash);
            let payload = NotificationPayload {
                subscription_id: sub.id.clone(),
                job: job.clone(),
                score: m.score,
            };
            match self.notification.send(&sub.tenant_id, payload, &key).await {
                Ok(()) => sent += 1,
                Err(err) => {
                    tracing::warn!(subscription_id = %sub.id, error = %err, "notification delivery failed");
                }
            }
        }
        sent
    }
}

fn normalize_and_dedup(raw_jobs: Vec<RawJob>, sub: &Subscription) -> Vec<NormalizedJob> {
    let mut seen: HashMap<String, NormalizedJob> = HashMap::new();
    for raw in raw_jobs {
        if is_wrong_country(&raw.location, sub) {
            continue;
        }
        let hash = content_hash(&raw.title, &raw.company, &raw.location);
        seen.entry(hash.clone()).or_insert(NormalizedJob { raw, content_hash: hash });
    }
    seen.into_values().collect()
}

const US_INDICATORS: [&str; 6] = ["united states", "usa", "california", "new york", "texas", "remote - us"];
const CANADA_INDICATORS: [&str; 5] = ["canada", "ontario", "quebec", "british columbia", "toronto"];

/// Heuristic rejection of jobs whose location string carries the opposite
/// country's indicators when the subscription targets a specific country
/// (GLOSSARY: "Wrong-country filter"). A subscription with no declared
/// country, or a location string matching neither indicator set, is never
/// filtered here.
fn is_wrong_country(location: &str, sub: &Subscription) -> bool {
    let Some(target_country) = sub.location.as_ref().and_then(|l| l.country.as_deref()) else {
        return false;
    };
    let lower = location.to_lowercase();

    match target_country.to_lowercase().as_str() {
        "canada" | "ca" => US_INDICATORS.iter().any(|ind| lower.contains(ind)),
        "united states" | "us" | "usa" => CANADA_INDICATORS.iter().any(|ind| lower.contains(ind)),
        _ => false,
    }
}

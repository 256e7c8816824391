//! Collection and matching workers.
//!
//! Both are thin: poll cancellation, pace via the rate limiter or key pool,
//! call the external adapter, classify the outcome into a retriable or
//! terminal `EngineError`. All the actual concurrency bounding happens in
//! the `Queue` (or, in fallback mode, a `Semaphore`) that calls these.

use std::sync::Arc;

use crate::adapters::{CollectionAdapter, CollectionRequest, LlmAdapter, LlmRequest};
use crate::cancellation::CancellationRegistry;
use crate::error::EngineError;
use crate::hash::resume_hash;
use crate::key_pool::KeyPool;
use crate::model::{JobMatch, NormalizedJob, RawJob, RunId};
use crate::rate_limiter::RateLimiter;
use crate::store::DurableStore;

pub struct CollectionWorker {
    pub adapter: Arc<dyn CollectionAdapter>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cancellation: Arc<CancellationRegistry>,
}

impl CollectionWorker {
    pub async fn collect(&self, run_id: &RunId, request: CollectionRequest) -> Result<Vec<RawJob>, EngineError> {
        if self.cancellation.is_cancelled(run_id).await {
            return Err(EngineError::Cancelled);
        }

        self.rate_limiter.wait(&request.source).await;

        match self.adapter.collect(request.clone()).await {
            Ok(jobs) => {
                self.rate_limiter.record_success(&request.source);
                Ok(jobs)
            }
            Err(message) => {
                if crate::error::is_429_like(&message) {
                    self.rate_limiter.record_429(&request.source);
                    Err(EngineError::RateLimited { source: request.source })
                } else {
                    self.rate_limiter.record_error(&request.source, &message);
                    Err(EngineError::Transient(message))
                }
            }
        }
    }
}

pub struct MatchingWorker {
    pub adapter: Arc<dyn LlmAdapter>,
    pub key_pool: Arc<KeyPool>,
    pub cancellation: Arc<CancellationRegistry>,
    pub store: Arc<dyn DurableStore>,
}

impl MatchingWorker {
    pub async fn score(
        &self,
        run_id: &RunId,
        job: &NormalizedJob,
        resume_text: &str,
    ) -> Result<JobMatch, EngineError> {
        if self.cancellation.is_cancelled(run_id).await {
            return Err(EngineError::Cancelled);
        }

        let resume_hash_value = resume_hash(resume_text);

        // Persistent match cache: identical (job, resume) pairs never hit the LLM twice.
        if let Ok(Some(cached)) = self
            .store
            .get_job_match(&job.content_hash, &resume_hash_value)
            .await
        {
            return Ok(cached);
        }

        let key = self.key_pool.get_available_key().await;
        let request = LlmRequest {
            job: job.clone(),
            resume_text: resume_text.to_string(),
        };

        let score = match self.adapter.score(request, &key).await {
            Ok(score) => score,
            Err(crate::adapters::LlmCallError::RateLimited) => {
                self.key_pool.mark_key_429(&key);
                return Err(EngineError::KeyRateLimited { masked_key: KeyPool::mask_key(&key) });
            }
            Err(crate::adapters::LlmCallError::SchemaInvalid(msg)) => {
                return Err(EngineError::ValidationFailed(msg));
            }
            Err(crate::adapters::LlmCallError::Other(msg)) => {
                return Err(EngineError::Transient(msg));
            }
        };

        let record = JobMatch {
            job_content_hash: job.content_hash.clone(),
            resume_hash: resume_hash_value,
            score,
        };
        let _ = self.store.put_job_match(record.clone()).await;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::kv::InMemoryKvStore;
    use crate::store::InMemoryDurableStore;
    use crate::testing::{FakeCollectionAdapter, FakeLlmAdapter};

    #[tokio::test]
    async fn collection_worker_records_429_and_surfaces_rate_limited() {
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(FakeClock::new(0));
        let kv = Arc::new(InMemoryKvStore::new(clock.clone()));
        let worker = CollectionWorker {
            adapter: Arc::new(FakeCollectionAdapter::always_429()),
            rate_limiter: Arc::new(RateLimiter::new(clock.clone())),
            cancellation: Arc::new(CancellationRegistry::new(kv, 3600)),
        };

        let request = CollectionRequest {
            query: "Backend Engineer".into(),
            location: None,
            is_remote: None,
            job_type: None,
            date_posted: None,
            source: "linkedin".into(),
            limit: 10,
            skip_cache: false,
        };

        let result = worker.collect(&"run-1".to_string(), request).await;
        assert!(matches!(result, Err(EngineError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn matching_worker_reuses_persistent_cache() {
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(FakeClock::new(0));
        let kv = Arc::new(InMemoryKvStore::new(clock.clone()));
        let store = Arc::new(InMemoryDurableStore::new());
        let adapter = Arc::new(FakeLlmAdapter::fixed_score(77));

        let worker = MatchingWorker {
            adapter: adapter.clone(),
            key_pool: Arc::new(KeyPool::new(clock.clone(), vec!["key-1".into()], 10)),
            cancellation: Arc::new(CancellationRegistry::new(kv, 3600)),
            store: store.clone(),
        };

        let job = NormalizedJob {
            raw: RawJob {
                title: "Backend Engineer".into(),
                company: "Acme".into(),
                location: "Remote".into(),
                description: "".into(),
                url: "https://example.com".into(),
                source: "linkedin".into(),
                date_posted: None,
            },
            content_hash: "hash-1".into(),
        };

        let first = worker.score(&"run-1".to_string(), &job, "resume text").await.unwrap();
        assert_eq!(first.score, 77);
        assert_eq!(adapter.call_count(), 1);

        let second = worker.score(&"run-1".to_string(), &job, "resume text").await.unwrap();
        assert_eq!(second.score, 77);
        // Second call hit the persistent cache, not the adapter.
        assert_eq!(adapter.call_count(), 1);
    }
}

//! Trivial fakes for the external adapters, used by this crate's own tests.
//! Real adapters (chat bot, resume parser, job boards, LLM provider) are out
//! of scope; these exist only so the engine's own behavior can be exercised
//! end to end without a network.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::adapters::{
    CollectionAdapter, CollectionRequest, LlmAdapter, LlmCallError, LlmRequest, NotificationAdapter, NotificationPayload, TitleExpander,
};
use crate::model::RawJob;

pub struct FakeCollectionAdapter {
    jobs: Vec<RawJob>,
    fail_with: Option<String>,
    calls: AtomicUsize,
}

impl FakeCollectionAdapter {
    pub fn with_jobs(jobs: Vec<RawJob>) -> Self {
        Self { jobs, fail_with: None, calls: AtomicUsize::new(0) }
    }

    pub fn always_429() -> Self {
        Self {
            jobs: Vec::new(),
            fail_with: Some("HTTP 429 Too Many Requests".to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CollectionAdapter for FakeCollectionAdapter {
    async fn collect(&self, _request: CollectionRequest) -> Result<Vec<RawJob>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(msg) => Err(msg.clone()),
            None => Ok(self.jobs.clone()),
        }
    }
}

pub struct FakeLlmAdapter {
    score: AtomicU32,
    calls: AtomicUsize,
}

impl FakeLlmAdapter {
    pub fn fixed_score(score: u8) -> Self {
        Self { score: AtomicU32::new(score as u32), calls: AtomicUsize::new(0) }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmAdapter for FakeLlmAdapter {
    async fn score(&self, _request: LlmRequest, _api_key: &str) -> Result<u8, LlmCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.score.load(Ordering::SeqCst) as u8)
    }
}

#[derive(Default)]
pub struct FakeNotificationAdapter {
    sent: Mutex<Vec<String>>,
}

impl FakeNotificationAdapter {
    pub fn sent_idempotency_keys(&self) -> Vec<String> {
        self.sent.lock().expect("fake notification lock poisoned").clone()
    }
}

#[async_trait]
impl NotificationAdapter for FakeNotificationAdapter {
    async fn send(&self, _chat_id: &str, _payload: NotificationPayload, idempotency_key: &str) -> Result<(), String> {
        self.sent
            .lock()
            .expect("fake notification lock poisoned")
            .push(idempotency_key.to_string());
        Ok(())
    }
}

/// Always returns a fixed extra-title list, ignoring the resume content.
pub struct FakeTitleExpander {
    extra: Vec<String>,
}

impl FakeTitleExpander {
    pub fn with_extra(extra: Vec<String>) -> Self {
        Self { extra }
    }
}

#[async_trait]
impl TitleExpander for FakeTitleExpander {
    async fn expand(&self, _resume_text: &str, _existing_titles: &[String], max_additional: usize) -> Result<Vec<String>, String> {
        Ok(self.extra.iter().take(max_additional).cloned().collect())
    }
}

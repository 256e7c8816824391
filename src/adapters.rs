//! Narrow capability traits for the three external collaborators: collection,
//! LLM scoring, and notification delivery. Each has exactly one method, so
//! fakes for testing implement them trivially.

use async_trait::async_trait;

use crate::model::NormalizedJob;

#[derive(Debug, Clone)]
pub struct CollectionRequest {
    pub query: String,
    pub location: Option<String>,
    pub is_remote: Option<bool>,
    pub job_type: Option<String>,
    pub date_posted: Option<String>,
    pub source: String,
    pub limit: u32,
    pub skip_cache: bool,
}

/// Real job-board integrations are out of scope; only the contract lives
/// here. It MUST surface HTTP 429s as an `Err` whose message contains one
/// of the rate-limit patterns the engine recognizes (`error::is_429_like`).
#[async_trait]
pub trait CollectionAdapter: Send + Sync {
    async fn collect(&self, request: CollectionRequest) -> Result<Vec<crate::model::RawJob>, String>;
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub job: NormalizedJob,
    pub resume_text: String,
}

#[derive(Debug, Clone)]
pub enum LlmCallError {
    RateLimited,
    SchemaInvalid(String),
    Other(String),
}

/// Prompt construction and provider selection are out of scope and live
/// entirely behind this trait. `score` MUST return a value already
/// validated against the declared schema (0-100); a value outside that
/// range is the adapter's bug, not the caller's to re-check.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn score(&self, request: LlmRequest, api_key: &str) -> Result<u8, LlmCallError>;
}

/// At-least-once delivery; duplicate suppression by `idempotency_key` is the
/// adapter's responsibility.
#[async_trait]
pub trait NotificationAdapter: Send + Sync {
    async fn send(&self, chat_id: &str, payload: NotificationPayload, idempotency_key: &str) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct NotificationPayload {
    pub subscription_id: String,
    pub job: NormalizedJob,
    pub score: u8,
}

/// Optional title-expansion step ahead of collection: an LLM suggests
/// additional search titles from a resume. Kept as its own narrow trait
/// rather than a second, differently-shaped method on `LlmAdapter`.
#[async_trait]
pub trait TitleExpander: Send + Sync {
    async fn expand(&self, resume_text: &str, existing_titles: &[String], max_additional: usize) -> Result<Vec<String>, String>;
}

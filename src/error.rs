use std::time::Duration;

/// Error kinds a worker or scheduler can observe while driving a run.
///
/// These map 1:1 onto the error-handling table of the engine design: each
/// variant carries just enough context for the caller to decide whether to
/// retry, back off a source/key, or fail the run outright.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("source {source} is rate limited")]
    RateLimited { source: String },

    #[error("llm key is rate limited")]
    KeyRateLimited { masked_key: String },

    #[error("llm response failed schema validation: {0}")]
    ValidationFailed(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("run was cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("partial failure: {0}")]
    Partial(String),
}

impl EngineError {
    /// Whether the queue should retry the unit of work that produced this error.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            EngineError::RateLimited { .. }
                | EngineError::KeyRateLimited { .. }
                | EngineError::ValidationFailed(_)
                | EngineError::Transient(_)
        )
    }

    /// True if the run as a whole must stop (cancellation, bad config).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Cancelled | EngineError::Configuration(_)
        )
    }
}

/// Patterns recognized as "this is a 429 in disguise", shared by the rate
/// limiter's error-message classifier and the collection worker's failure
/// handling so the two never drift apart.
const RATE_LIMIT_PATTERNS: [&str; 5] =
    ["429", "too many requests", "rate limit", "throttle", "quota"];

/// True if `message` looks like a rate-limit/throttling error from an
/// upstream adapter, case-insensitively.
pub fn is_429_like(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

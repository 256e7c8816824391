//! SHA-256-based hashing used throughout the engine: the request-cache key,
//! a posting's content hash, and the notification idempotency key.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Parameters that identify a collection request, in the exact shape hashed
/// for the request-cache key.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionParams<'a> {
    pub query: &'a str,
    pub location: Option<&'a str>,
    pub is_remote: Option<bool>,
    pub job_type: Option<&'a str>,
    pub date_posted: Option<&'a str>,
    pub source: &'a str,
    pub limit: u32,
}

/// `SHA-256(JSON(params))[:16]` hex chars.
pub fn cache_key(params: &CollectionParams<'_>) -> String {
    let json = serde_json::to_vec(params).expect("CollectionParams always serializes");
    let digest = Sha256::digest(&json);
    hex::encode(digest)[..16].to_string()
}

/// Normalizes a string for content-hash comparison: lowercase, trimmed,
/// internal whitespace collapsed to single spaces. Two postings that differ
/// only in casing or incidental whitespace hash identically.
pub fn normalize(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `SHA-256` over normalized `(title, company, location)` — the job
/// deduplication key.
pub fn content_hash(title: &str, company: &str, location: &str) -> String {
    let joined = format!(
        "{}\u{1}{}\u{1}{}",
        normalize(title),
        normalize(company),
        normalize(location)
    );
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// `SHA-256(subId ⊕ contentHash)` — the notification idempotency key.
pub fn idempotency_key(subscription_id: &str, job_content_hash: &str) -> String {
    let joined = format!("{}\u{1}{}", subscription_id, job_content_hash);
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// `SHA-256` of resume text, used as `Subscription.resume_hash` and as half
/// of the persistent match-cache key `(contentHash, resumeHash)`.
pub fn resume_hash(resume_text: &str) -> String {
    hex::encode(Sha256::digest(resume_text.as_bytes()))
}

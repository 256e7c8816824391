//! Per-source adaptive rate limiter.
//!
//! One process-wide instance, `SourceState` mutations serialized behind a
//! single mutex — the cooldown/backoff math depends on multi-field
//! coherence (consecutive-429 count, cooldown deadline, last-request time),
//! so per-field atomics would not be safe here.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::is_429_like;
use crate::model::SourceState;

#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub cooldown_threshold: u32,
    pub cooldown_duration_ms: u64,
    pub success_delay_ms: u64,
}

impl SourceProfile {
    /// Conservative defaults for a source known to be aggressive about 429s.
    pub fn aggressive() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            cooldown_threshold: 3,
            cooldown_duration_ms: 60_000,
            success_delay_ms: 3_000,
        }
    }

    /// Defaults for a source that tolerates a brisker pace.
    pub fn lenient() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            cooldown_threshold: 5,
            cooldown_duration_ms: 30_000,
            success_delay_ms: 1_000,
        }
    }

    /// Used for any source without a named profile.
    pub fn default_profile() -> Self {
        Self {
            base_delay_ms: 1_500,
            max_delay_ms: 45_000,
            backoff_multiplier: 2.0,
            cooldown_threshold: 4,
            cooldown_duration_ms: 45_000,
            success_delay_ms: 1_500,
        }
    }
}

pub struct RateLimiter {
    clock: std::sync::Arc<dyn Clock>,
    profiles: HashMap<String, SourceProfile>,
    default_profile: SourceProfile,
    state: Mutex<HashMap<String, SourceState>>,
}

impl RateLimiter {
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("linkedin".to_string(), SourceProfile::aggressive());
        profiles.insert("indeed".to_string(), SourceProfile::lenient());
        Self {
            clock,
            profiles,
            default_profile: SourceProfile::default_profile(),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_profile(mut self, source: &str, profile: SourceProfile) -> Self {
        self.profiles.insert(source.to_string(), profile);
        self
    }

    /// Overrides the profile used for any source without its own named
    /// entry (`COLLECT_MIN_DELAY_MS` in distilled §6).
    pub fn with_default_profile(mut self, profile: SourceProfile) -> Self {
        self.default_profile = profile;
        self
    }

    fn profile_for(&self, source: &str) -> &SourceProfile {
        self.profiles.get(source).unwrap_or(&self.default_profile)
    }

    /// Computes how long the caller must still wait before hitting `source`,
    /// and records `last_request_at` as if the request is about to be sent
    /// ("record before the call" to avoid a race with a concurrent caller).
    pub fn get_required_delay(&self, source: &str) -> Duration {
        let now = self.clock.now_unix();
        let profile = self.profile_for(source).clone();
        let mut states = self.state.lock().expect("rate limiter lock poisoned");
        let state = states.entry(source.to_string()).or_default();

        if state.in_cooldown {
            if let Some(until) = state.cooldown_until {
                if now < until {
                    return Duration::from_secs(until - now);
                }
            }
            state.in_cooldown = false;
            state.cooldown_until = None;
            state.consecutive_429s = 0.0;
        }

        let delay_ms = if state.consecutive_429s > 0.0 {
            let scaled = (profile.base_delay_ms as f64)
                * profile.backoff_multiplier.powf(state.consecutive_429s as f64);
            let capped = scaled.min(profile.max_delay_ms as f64);
            let jitter = rand::thread_rng().gen_range(0.8..1.2);
            (capped * jitter) as u64
        } else {
            profile.success_delay_ms
        };

        let elapsed_ms = state
            .last_request_at
            .map(|last| now.saturating_sub(last) * 1000)
            .unwrap_or(0);
        let remaining_ms = delay_ms.saturating_sub(elapsed_ms);
        Duration::from_millis(remaining_ms)
    }

    /// Sleeps for `get_required_delay(source)` and marks the request as sent.
    pub async fn wait(&self, source: &str) {
        let delay = self.get_required_delay(source);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let now = self.clock.now_unix();
        let mut states = self.state.lock().expect("rate limiter lock poisoned");
        states.entry(source.to_string()).or_default().last_request_at = Some(now);
    }

    pub fn record_success(&self, source: &str) {
        let mut states = self.state.lock().expect("rate limiter lock poisoned");
        let state = states.entry(source.to_string()).or_default();
        state.consecutive_429s = (state.consecutive_429s - 1.0).max(0.0);
    }

    pub fn record_429(&self, source: &str) {
        let now = self.clock.now_unix();
        let profile = self.profile_for(source).clone();
        let mut states = self.state.lock().expect("rate limiter lock poisoned");
        let state = states.entry(source.to_string()).or_default();
        state.consecutive_429s += 1.0;
        if state.consecutive_429s as u32 >= profile.cooldown_threshold {
            state.in_cooldown = true;
            state.cooldown_until = Some(now + profile.cooldown_duration_ms / 1000);
        }
    }

    /// Fractional increment for an error whose message doesn't match the
    /// 429 pattern set, capped at 2.0 total so a string of ambiguous errors
    /// doesn't spiral as fast as confirmed 429s.
    pub fn record_error(&self, source: &str, message: &str) {
        if is_429_like(message) {
            self.record_429(source);
            return;
        }
        let mut states = self.state.lock().expect("rate limiter lock poisoned");
        let state = states.entry(source.to_string()).or_default();
        // The 2.0 ceiling only bounds how high ambiguous errors alone can
        // push the counter; it must never pull down a count already raised
        // by confirmed 429s.
        let ceiling = state.consecutive_429s.max(2.0);
        state.consecutive_429s = (state.consecutive_429s + 0.5).min(ceiling);
    }
}

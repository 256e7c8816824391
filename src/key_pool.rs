//! LLM API-key sliding-window rate pool.

use std::sync::Mutex;
use std::time::Duration;

use crate::clock::Clock;
use crate::model::KeyStat;

const WINDOW_SECS: u64 = 60;

pub struct KeyPool {
    clock: std::sync::Arc<dyn Clock>,
    keys: Vec<String>,
    rate_per_minute: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    stats: Vec<KeyStat>,
    current_index: usize,
}

impl KeyPool {
    /// `keys` is either a list or a single fallback key.
    pub fn new(clock: std::sync::Arc<dyn Clock>, keys: Vec<String>, rate_per_minute: usize) -> Self {
        assert!(!keys.is_empty(), "key pool requires at least one key");
        let stats = keys.iter().map(|_| KeyStat::default()).collect();
        Self {
            clock,
            keys,
            rate_per_minute,
            state: Mutex::new(PoolState { stats, current_index: 0 }),
        }
    }

    fn sweep_locked(&self, state: &mut PoolState, now: u64) {
        for stat in &mut state.stats {
            stat.timestamps.retain(|ts| now.saturating_sub(*ts) < WINDOW_SECS);
            if let Some(until) = stat.blocked_until {
                if now >= until {
                    stat.is_429_blocked = false;
                    stat.blocked_until = None;
                }
            }
        }
    }

    /// Returns an available key, sleeping and recursing if none is free yet.
    pub async fn get_available_key(&self) -> String {
        loop {
            let now = self.clock.now_unix();
            match self.try_acquire(now) {
                KeyOutcome::Key(k) => return k,
                KeyOutcome::WaitThenRetry(wait) => {
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
    }

    /// One non-blocking attempt: returns a key if one is free, or how long
    /// to wait before trying again. Factored out of `get_available_key` so
    /// the sliding-window/round-robin math can be tested without real
    /// sleeps — a test can call this directly with an arbitrary `now`.
    fn try_acquire(&self, now: u64) -> KeyOutcome {
        let mut state = self.state.lock().expect("key pool lock poisoned");
        self.sweep_locked(&mut state, now);

        let n = self.keys.len();
        let start = state.current_index;
        let mut found = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let stat = &state.stats[idx];
            if stat.timestamps.len() < self.rate_per_minute && !stat.is_429_blocked {
                found = Some(idx);
                break;
            }
        }

        match found {
            Some(idx) => {
                state.stats[idx].timestamps.push(now);
                state.current_index = (idx + 1) % n;
                KeyOutcome::Key(self.keys[idx].clone())
            }
            None => {
                let wait = state
                    .stats
                    .iter()
                    .map(|s| self.min_wait_for(s, now))
                    .min()
                    .unwrap_or(Duration::from_secs(1));
                KeyOutcome::WaitThenRetry(wait)
            }
        }
    }

    fn min_wait_for(&self, stat: &KeyStat, now: u64) -> Duration {
        let block_wait = stat
            .blocked_until
            .map(|until| until.saturating_sub(now))
            .filter(|_| stat.is_429_blocked);
        let window_wait = stat
            .timestamps
            .iter()
            .min()
            .map(|oldest| (oldest + WINDOW_SECS).saturating_sub(now));
        let candidate = match (block_wait, window_wait) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => 1,
        };
        Duration::from_secs(candidate.max(1))
    }

    pub fn mark_key_429(&self, key: &str) {
        let now = self.clock.now_unix();
        let mut state = self.state.lock().expect("key pool lock poisoned");
        if let Some(idx) = self.keys.iter().position(|k| k == key) {
            state.stats[idx].is_429_blocked = true;
            state.stats[idx].blocked_until = Some(now + WINDOW_SECS);
        }
    }

    /// Only ever used in logs: `"***" + last8`, or `"***"` for short keys.
    pub fn mask_key(key: &str) -> String {
        if key.len() > 8 {
            format!("***{}", &key[key.len() - 8..])
        } else {
            "***".to_string()
        }
    }
}

enum KeyOutcome {
    Key(String),
    WaitThenRetry(Duration),
}

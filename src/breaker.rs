//! Per-provider circuit breaker.
//!
//! Tracks a rolling window of call outcomes per `(provider, region)` key.
//! State reads are lock-free (an `AtomicU8` compare-and-swap machine); the
//! rolling window sits behind a short-lived mutex. Health probes feed the
//! same entries as live traffic but run on their own cadence.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::BreakerConfig;

/// Circuit states (stored as AtomicU8)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct OutcomeWindow {
    outcomes: VecDeque<(bool, u64)>, // (success, latency ms)
    cap: usize,
}

impl OutcomeWindow {
    fn new(cap: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(cap),
            cap,
        }
    }

    fn push(&mut self, success: bool, latency_ms: u64) {
        if self.outcomes.len() == self.cap {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back((success, latency_ms));
    }

    fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|(ok, _)| !ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn p95_latency_ms(&self) -> u64 {
        if self.outcomes.is_empty() {
            return 0;
        }
        let mut latencies: Vec<u64> = self.outcomes.iter().map(|(_, ms)| *ms).collect();
        latencies.sort_unstable();
        let index = (latencies.len() * 95).div_ceil(100).saturating_sub(1);
        latencies[index]
    }
}

struct BreakerEntry {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    open_until_ms: AtomicI64,
    window: Mutex<OutcomeWindow>,
}

impl BreakerEntry {
    fn new(window_cap: usize) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            open_until_ms: AtomicI64::new(0),
            window: Mutex::new(OutcomeWindow::new(window_cap)),
        }
    }

    fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn trip_open(&self, cooldown: Duration, now_ms: i64) {
        self.open_until_ms
            .store(now_ms + cooldown.as_millis() as i64, Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub error_rate: f64,
    pub p95_latency_ms: u64,
}

pub struct CircuitBreaker {
    entries: DashMap<String, Arc<BreakerEntry>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn key(provider: &str, region: Option<&str>) -> String {
        match region {
            Some(region) => format!("{provider}@{region}"),
            None => provider.to_string(),
        }
    }

    fn entry(&self, key: &str, config: &BreakerConfig) -> Arc<BreakerEntry> {
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(BreakerEntry::new(config.window)))
            .clone()
    }

    /// Whether the router may dispatch to this provider right now. An open
    /// circuit whose cooldown elapsed moves to half-open and admits probes.
    pub fn allow(&self, key: &str, config: &BreakerConfig) -> bool {
        let entry = self.entry(key, config);
        match entry.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                if now_ms >= entry.open_until_ms.load(Ordering::Acquire) {
                    if entry.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        entry.half_open_successes.store(0, Ordering::Release);
                        tracing::info!(breaker = %key, "circuit half-open, admitting probes");
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.entries
            .get(key)
            .map(|e| e.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn record_success(&self, key: &str, latency: Duration, config: &BreakerConfig) {
        let entry = self.entry(key, config);
        entry
            .window
            .lock()
            .expect("breaker window poisoned")
            .push(true, latency.as_millis() as u64);
        entry.consecutive_failures.store(0, Ordering::Release);

        if entry.state() == CircuitState::HalfOpen {
            let successes = entry.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= config.half_open_successes
                && entry.transition(CircuitState::HalfOpen, CircuitState::Closed)
            {
                tracing::info!(breaker = %key, "circuit closed");
            }
        }
    }

    pub fn record_failure(&self, key: &str, latency: Duration, config: &BreakerConfig) {
        let entry = self.entry(key, config);
        let error_rate = {
            let mut window = entry.window.lock().expect("breaker window poisoned");
            window.push(false, latency.as_millis() as u64);
            window.error_rate()
        };
        let consecutive = entry.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let cooldown = Duration::from_secs(config.cooldown_secs);

        match entry.state() {
            // Any failure while half-open re-opens immediately.
            CircuitState::HalfOpen => {
                entry.trip_open(cooldown, now_ms);
                tracing::warn!(breaker = %key, "circuit re-opened from half-open");
            }
            CircuitState::Closed => {
                if consecutive >= config.consecutive_failures
                    || error_rate > config.error_rate_threshold
                {
                    entry.trip_open(cooldown, now_ms);
                    tracing::warn!(
                        breaker = %key,
                        consecutive,
                        error_rate,
                        "circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.entries
            .iter()
            .map(|item| {
                let window = item.value().window.lock().expect("breaker window poisoned");
                BreakerSnapshot {
                    key: item.key().clone(),
                    state: item.value().state(),
                    error_rate: window.error_rate(),
                    p95_latency_ms: window.p95_latency_ms(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        serde_json::from_value(serde_json::json!({
            "consecutive_failures": 3,
            "error_rate_threshold": 1.0,
            "cooldown_secs": 0,
            "half_open_successes": 2,
            "window": 10,
        }))
        .unwrap()
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new();
        let cfg = config();
        for _ in 0..2 {
            breaker.record_failure("p1", Duration::from_millis(10), &cfg);
        }
        assert_eq!(breaker.state("p1"), CircuitState::Closed);
        breaker.record_failure("p1", Duration::from_millis(10), &cfg);
        assert_eq!(breaker.state("p1"), CircuitState::Open);
    }

    #[test]
    fn test_half_open_then_closed() {
        let breaker = CircuitBreaker::new();
        let cfg = config();
        for _ in 0..3 {
            breaker.record_failure("p1", Duration::from_millis(10), &cfg);
        }
        // Cooldown is zero, so the next allow() flips to half-open.
        assert!(breaker.allow("p1", &cfg));
        assert_eq!(breaker.state("p1"), CircuitState::HalfOpen);

        breaker.record_success("p1", Duration::from_millis(5), &cfg);
        assert_eq!(breaker.state("p1"), CircuitState::HalfOpen);
        breaker.record_success("p1", Duration::from_millis(5), &cfg);
        assert_eq!(breaker.state("p1"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new();
        let cfg = config();
        for _ in 0..3 {
            breaker.record_failure("p1", Duration::from_millis(10), &cfg);
        }
        assert!(breaker.allow("p1", &cfg));
        breaker.record_failure("p1", Duration::from_millis(10), &cfg);
        assert_eq!(breaker.state("p1"), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive() {
        let breaker = CircuitBreaker::new();
        let cfg = config();
        breaker.record_failure("p1", Duration::from_millis(10), &cfg);
        breaker.record_failure("p1", Duration::from_millis(10), &cfg);
        breaker.record_success("p1", Duration::from_millis(10), &cfg);
        breaker.record_failure("p1", Duration::from_millis(10), &cfg);
        assert_eq!(breaker.state("p1"), CircuitState::Closed);
    }

    #[test]
    fn test_key_includes_region() {
        assert_eq!(CircuitBreaker::key("openai", None), "openai");
        assert_eq!(CircuitBreaker::key("bedrock", Some("us-east-1")), "bedrock@us-east-1");
    }
}

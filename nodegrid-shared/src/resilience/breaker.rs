//! Circuit breaker state machine, grounded in the teacher's
//! `resilience::behavior::CircuitBreakerBehavior` implementations (web
//! database / task readiness / FFI completion / messaging breakers all
//! share this Closed → Open → HalfOpen → Closed model).

use super::metrics::CircuitBreakerMetrics;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// A single circuit breaker instance, identified by `name` for logging and
/// metrics correlation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    half_open_successes: AtomicU64,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            consecutive_failures: AtomicU64::new(0),
            half_open_successes: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, new_state: CircuitState) {
        let old = self.state();
        self.state.store(new_state.to_u8(), Ordering::Release);
        if old != new_state {
            tracing::info!(
                circuit_breaker = %self.name,
                from = ?old,
                to = ?new_state,
                "circuit breaker state transition"
            );
        }
    }

    /// Whether a call should be allowed through right now. Transitions
    /// Open → HalfOpen once the recovery timeout has elapsed.
    pub fn should_allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .unwrap()
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.timeout {
                    self.half_open_successes.store(0, Ordering::Release);
                    self.set_state(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success_manual(&self, _duration: Duration) {
        self.record_success(_duration)
    }

    pub fn record_failure_manual(&self, _duration: Duration) {
        self.record_failure(_duration)
    }

    pub fn record_success(&self, _duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);

        if self.state() == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold as u64 {
                self.set_state(CircuitState::Closed);
                *self.opened_at.lock().unwrap() = None;
            }
        }
    }

    pub fn record_failure(&self, _duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        match self.state() {
            CircuitState::HalfOpen => {
                self.trip();
            }
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold as u64 {
                    self.trip();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self) {
        *self.opened_at.lock().unwrap() = Some(Instant::now());
        self.set_state(CircuitState::Open);
    }

    pub fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }

    pub fn force_open(&self) {
        *self.opened_at.lock().unwrap() = Some(Instant::now());
        self.set_state(CircuitState::Open);
    }

    pub fn force_closed(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        *self.opened_at.lock().unwrap() = None;
        self.set_state(CircuitState::Closed);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let total = self.total_calls.load(Ordering::Relaxed);
        let failures = self.total_failures.load(Ordering::Relaxed);
        CircuitBreakerMetrics {
            total_calls: total,
            success_count: self.total_successes.load(Ordering::Relaxed),
            failure_count: failures,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            current_state: self.state(),
            failure_rate: if total == 0 {
                0.0
            } else {
                failures as f64 / total as f64
            },
        }
    }
}

impl super::CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        CircuitBreaker::name(self)
    }

    fn state(&self) -> CircuitState {
        CircuitBreaker::state(self)
    }

    fn should_allow(&self) -> bool {
        CircuitBreaker::should_allow(self)
    }

    fn record_success(&self, duration: Duration) {
        CircuitBreaker::record_success(self, duration)
    }

    fn record_failure(&self, duration: Duration) {
        CircuitBreaker::record_failure(self, duration)
    }

    fn is_healthy(&self) -> bool {
        CircuitBreaker::is_healthy(self)
    }

    fn force_open(&self) {
        CircuitBreaker::force_open(self)
    }

    fn force_closed(&self) {
        CircuitBreaker::force_closed(self)
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreaker::metrics(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test".to_string(),
            CircuitBreakerConfig {
                failure_threshold,
                timeout: Duration::from_millis(50),
                success_threshold,
            },
        )
    }

    #[test]
    fn starts_closed() {
        let cb = breaker(3, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_allow());
    }

    #[test]
    fn trips_open_after_threshold_failures() {
        let cb = breaker(3, 2);
        for _ in 0..3 {
            cb.record_failure(Duration::ZERO);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());
    }

    #[test]
    fn half_opens_after_timeout_and_closes_after_successes() {
        let cb = breaker(1, 2);
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = breaker(1, 2);
        cb.force_open();
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn force_closed_resets_failure_count() {
        let cb = breaker(2, 2);
        cb.record_failure(Duration::ZERO);
        cb.force_closed();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn metrics_track_failure_rate() {
        let cb = breaker(10, 2);
        cb.record_success(Duration::ZERO);
        cb.record_failure(Duration::ZERO);
        let m = cb.metrics();
        assert_eq!(m.total_calls, 2);
        assert!((m.failure_rate - 0.5).abs() < f64::EPSILON);
    }
}

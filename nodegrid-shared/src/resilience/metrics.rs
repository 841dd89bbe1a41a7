//! Circuit breaker metrics snapshot, grounded in the teacher's
//! `resilience::metrics::CircuitBreakerMetrics`.

use super::breaker::CircuitState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub current_state: CircuitState,
    pub failure_rate: f64,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    pub fn format_summary(&self) -> String {
        format!(
            "state={:?} calls={} success={} failure={} rate={:.2}%",
            self.current_state,
            self.total_calls,
            self.success_count,
            self.failure_count,
            self.failure_rate * 100.0
        )
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_metrics_are_healthy() {
        assert!(CircuitBreakerMetrics::new().is_healthy());
    }

    #[test]
    fn open_state_is_never_healthy() {
        let mut m = CircuitBreakerMetrics::new();
        m.current_state = CircuitState::Open;
        assert!(!m.is_healthy());
    }
}

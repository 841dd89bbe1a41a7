//! # Resilience
//!
//! Circuit breaker protecting outbound gate sends and job-worker dispatch,
//! grounded in the teacher's `tasker-shared::resilience` module (same
//! three-state model: Closed → Open → HalfOpen → Closed).

mod breaker;
mod metrics;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use metrics::CircuitBreakerMetrics;

/// Unified interface for circuit breaker implementations, mirroring the
/// teacher's object-safe `CircuitBreakerBehavior` trait so callers can hold
/// `&dyn CircuitBreakerBehavior` when uniform access is needed (health
/// reporting, metrics collection).
pub trait CircuitBreakerBehavior: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn state(&self) -> CircuitState;
    fn should_allow(&self) -> bool;
    fn record_success(&self, duration: std::time::Duration);
    fn record_failure(&self, duration: std::time::Duration);
    fn is_healthy(&self) -> bool;
    fn force_open(&self);
    fn force_closed(&self);
    fn metrics(&self) -> CircuitBreakerMetrics;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_object_safe(_: &dyn CircuitBreakerBehavior) {}
}

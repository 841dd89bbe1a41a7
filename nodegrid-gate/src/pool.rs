//! Outbound connection pool, grounded in
//! `examples/original_source/libs/grd/include/grd/ConnectionPool.h`
//! (`scConnectionPool`): connections keyed by receiver host, with a
//! sweep that drops anything idle past the configured timeout. Wraps
//! each key's send path behind its own [`CircuitBreaker`] so a wedged
//! peer doesn't stall envelopes addressed to every other peer.

use dashmap::DashMap;
use nodegrid_shared::resilience::{CircuitBreaker, CircuitBreakerConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct PooledConnection {
    last_used: Instant,
    breaker: Arc<CircuitBreaker>,
}

/// Tracks one logical connection per receiver host and sweeps idle
/// entries. Does not itself hold transport sockets — transport-specific
/// gates key their own socket maps the same way and consult this pool
/// for liveness/breaker state.
pub struct ConnectionPool {
    connections: DashMap<String, PooledConnection>,
    inactivity_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(inactivity_timeout: Duration) -> Self {
        ConnectionPool {
            connections: DashMap::new(),
            inactivity_timeout,
        }
    }

    /// Mark `host` as just used, creating its entry (and breaker) on
    /// first contact.
    pub fn touch(&self, host: &str) -> Arc<CircuitBreaker> {
        let mut entry = self.connections.entry(host.to_string()).or_insert_with(|| PooledConnection {
            last_used: Instant::now(),
            breaker: Arc::new(CircuitBreaker::new(host.to_string(), CircuitBreakerConfig::default())),
        });
        entry.last_used = Instant::now();
        entry.breaker.clone()
    }

    pub fn breaker_for(&self, host: &str) -> Option<Arc<CircuitBreaker>> {
        self.connections.get(host).map(|e| e.breaker.clone())
    }

    pub fn contains(&self, host: &str) -> bool {
        self.connections.contains_key(host)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop every connection idle beyond `inactivity_timeout`, returning
    /// the hosts removed.
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let dead: Vec<String> = self
            .connections
            .iter()
            .filter(|e| now.duration_since(e.last_used) >= self.inactivity_timeout)
            .map(|e| e.key().clone())
            .collect();
        for host in &dead {
            self.connections.remove(host);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_creates_and_reuses_breaker() {
        let pool = ConnectionPool::new(Duration::from_secs(60));
        let b1 = pool.touch("hostA");
        let b2 = pool.touch("hostA");
        assert!(Arc::ptr_eq(&b1, &b2));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn sweep_drops_only_idle_entries() {
        let pool = ConnectionPool::new(Duration::from_millis(10));
        pool.touch("hostA");
        std::thread::sleep(Duration::from_millis(20));
        pool.touch("hostB");
        let dropped = pool.sweep();
        assert_eq!(dropped, vec!["hostA".to_string()]);
        assert!(pool.contains("hostB"));
        assert!(!pool.contains("hostA"));
    }
}

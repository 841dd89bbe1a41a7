//! In-process gate pair, grounded in the teacher's in-memory messaging
//! provider pattern (`MessagingProvider::new_in_memory()`): lets tests
//! and single-process deployments wire two schedulers (or a scheduler to
//! itself) together without a real transport.

use crate::gate::Gate;
use async_trait::async_trait;
use nodegrid_address::Address;
use nodegrid_protocol::Envelope;
use nodegrid_shared::NodegridResult;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub struct LoopbackGate {
    name: String,
    protocol: String,
    own_address: Option<Address>,
    pending_out: Mutex<VecDeque<Envelope>>,
    inbound: Arc<Mutex<VecDeque<Envelope>>>,
    peer_inbound: Arc<Mutex<VecDeque<Envelope>>>,
}

impl LoopbackGate {
    /// Create two gates that deliver to each other: whatever `a.put()`
    /// queues shows up in `b.get()` after `a.run()`, and vice versa.
    pub fn pair(protocol: impl Into<String>) -> (LoopbackGate, LoopbackGate) {
        let protocol = protocol.into();
        let q_a_inbound = Arc::new(Mutex::new(VecDeque::new()));
        let q_b_inbound = Arc::new(Mutex::new(VecDeque::new()));

        let a = LoopbackGate {
            name: format!("{protocol}-loopback-a"),
            protocol: protocol.clone(),
            own_address: None,
            pending_out: Mutex::new(VecDeque::new()),
            inbound: q_a_inbound.clone(),
            peer_inbound: q_b_inbound.clone(),
        };
        let b = LoopbackGate {
            name: format!("{protocol}-loopback-b"),
            protocol,
            own_address: None,
            pending_out: Mutex::new(VecDeque::new()),
            inbound: q_b_inbound,
            peer_inbound: q_a_inbound,
        };
        (a, b)
    }

    pub fn with_own_address(mut self, address: Address) -> Self {
        self.own_address = Some(address);
        self
    }
}

#[async_trait]
impl Gate for LoopbackGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_protocol(&self, protocol: &str) -> bool {
        protocol == self.protocol
    }

    fn own_address(&self, protocol: &str) -> Option<Address> {
        if protocol == self.protocol {
            self.own_address.clone()
        } else {
            None
        }
    }

    async fn run(&self) -> NodegridResult<i32> {
        let mut out = self.pending_out.lock().unwrap();
        let moved = out.len();
        if moved > 0 {
            self.peer_inbound.lock().unwrap().extend(out.drain(..));
        }
        Ok(moved as i32)
    }

    async fn put(&self, envelope: Envelope) {
        self.pending_out.lock().unwrap().push_back(envelope);
    }

    async fn get(&self) -> Option<Envelope> {
        self.inbound.lock().unwrap().pop_front()
    }

    fn empty(&self) -> bool {
        self.inbound.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrid_address::Address as Addr;
    use nodegrid_shared::Value;

    #[tokio::test]
    async fn envelope_put_on_a_arrives_at_b_after_run() {
        let (a, b) = LoopbackGate::pair("loop");
        let env = Envelope::request(Addr::raw("A"), Addr::raw("B"), 1, "core.echo", Value::Null, 0);
        a.put(env).await;
        assert!(b.empty());
        let moved = a.run().await.unwrap();
        assert_eq!(moved, 1);
        assert!(!b.empty());
        let received = b.get().await.unwrap();
        assert_eq!(received.request_id(), 1);
    }

    #[tokio::test]
    async fn supports_protocol_matches_only_configured_protocol() {
        let (a, _b) = LoopbackGate::pair("loop");
        assert!(a.supports_protocol("loop"));
        assert!(!a.supports_protocol("tcp"));
    }
}

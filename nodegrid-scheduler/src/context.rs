//! Shared context handed to tasks and modules during a dispatch step:
//! a place to post outbound envelopes and a source of fresh request ids.

use nodegrid_address::Address;
use nodegrid_protocol::Envelope;
use std::sync::atomic::{AtomicI64, Ordering};

/// Monotonic, positive, unique-per-scheduler-lifetime request id
/// generator (spec §4.4 "Request IDs"). `0` is reserved for
/// fire-and-forget and is never returned by `next()`.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: AtomicI64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        RequestIdGenerator { next: AtomicI64::new(0) }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Passed to [`crate::Task::run_step`] and [`crate::Module::handle_message`]
/// so they can emit envelopes and mint request ids without holding a
/// reference to the whole scheduler.
pub struct StepContext<'a> {
    pub own_address: &'a Address,
    outbox: &'a mut Vec<Envelope>,
    ids: &'a RequestIdGenerator,
}

impl<'a> StepContext<'a> {
    pub fn new(own_address: &'a Address, outbox: &'a mut Vec<Envelope>, ids: &'a RequestIdGenerator) -> Self {
        StepContext { own_address, outbox, ids }
    }

    pub fn post(&mut self, envelope: Envelope) {
        self.outbox.push(envelope);
    }

    pub fn next_request_id(&self) -> i64 {
        self.ids.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_positive_and_monotonic() {
        let gen = RequestIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert!(a > 0);
        assert!(b > a);
    }
}

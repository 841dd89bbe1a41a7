//! Gate contract, grounded in
//! `examples/original_source/libs/grd/include/grd/MessageGate.h`
//! (`scMessageGate`): one base shape for both directions of traffic —
//! input gates fill their queue from `run()` for the scheduler to drain
//! via `get()`/`empty()`, output gates drain their queue (fed by
//! `put()`) inside `run()` and transmit.

use async_trait::async_trait;
use nodegrid_address::Address;
use nodegrid_protocol::Envelope;
use nodegrid_shared::NodegridResult;

#[async_trait]
pub trait Gate: Send + Sync {
    /// Name used in logs and in the scheduler's gate list.
    fn name(&self) -> &str;

    fn supports_protocol(&self, protocol: &str) -> bool;

    /// The address this gate answers to for `protocol`, if it owns one
    /// (e.g. a listening socket's own host/port). `None` for gates that
    /// are purely outbound.
    fn own_address(&self, _protocol: &str) -> Option<Address> {
        None
    }

    /// Allocate the listening endpoint or client pool. Must be
    /// idempotent — the scheduler may call it again after a transient
    /// setup failure.
    async fn init(&self) -> NodegridResult<()> {
        Ok(())
    }

    /// Perform one non-blocking I/O slice. Returns the number of
    /// envelopes moved (received for an input gate, transmitted for an
    /// output gate).
    async fn run(&self) -> NodegridResult<i32>;

    /// Queue an envelope for transmission (output gates) or for local
    /// delivery (loopback/test gates).
    async fn put(&self, envelope: Envelope);

    /// Pop the next decoded envelope an input gate has buffered.
    async fn get(&self) -> Option<Envelope>;

    fn empty(&self) -> bool;
}

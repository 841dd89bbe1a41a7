//! Pluggable wire codec (spec §4.3 "Framing": "each transport owns its
//! own framing; the envelope is serialized/deserialized through an
//! injected codec"). Gates hold a `Box<dyn Codec>` rather than baking in
//! a format, so the same scheduler can speak JSON to one peer and a
//! binary format to another.

use crate::envelope::Envelope;
use nodegrid_shared::NodegridResult;

pub trait Codec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> NodegridResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> NodegridResult<Envelope>;
}

/// Reference codec: newline-free JSON. Used by the in-process and
/// loopback gates, and as the default for any transport that doesn't
/// specify one.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> NodegridResult<Vec<u8>> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> NodegridResult<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use nodegrid_address::Address;
    use nodegrid_shared::Value;

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec;
        let env = Envelope {
            sender: Address::raw("A"),
            receiver: Address::raw("B"),
            timeout_ms: 250,
            event: Event::request(1, "core.echo", Value::from("hi")),
        };
        let bytes = codec.encode(&env).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back.timeout_ms, 250);
        assert_eq!(back.request_id(), 1);
    }
}

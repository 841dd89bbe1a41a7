//! # nodegrid-protocol
//!
//! The envelope/event wire model (spec §4.2) and the codec trait gates
//! use to serialize it onto a transport.

mod codec;
mod envelope;
mod event;

pub use codec::{Codec, JsonCodec};
pub use envelope::Envelope;
pub use event::{Event, NO_REQUEST_ID};

//! Envelope: sender, receiver, timeout, and a tagged [`crate::Event`],
//! per spec §4.2. Timeout lives on the envelope rather than the event
//! because responses don't need their own timeout — they correlate back
//! to the original request instead.

use crate::event::Event;
use nodegrid_address::Address;
use nodegrid_shared::{StatusCode, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Address,
    pub receiver: Address,
    /// Milliseconds; `0` means no timeout.
    pub timeout_ms: u32,
    pub event: Event,
}

impl Envelope {
    pub fn request(
        sender: Address,
        receiver: Address,
        request_id: i64,
        command: impl Into<String>,
        params: Value,
        timeout_ms: u32,
    ) -> Self {
        Envelope {
            sender,
            receiver,
            timeout_ms,
            event: Event::request(request_id, command, params),
        }
    }

    pub fn request_id(&self) -> i64 {
        self.event.request_id()
    }

    pub fn has_timeout(&self) -> bool {
        self.timeout_ms != 0
    }

    /// Build the response envelope for this request: sender/receiver
    /// swapped, same `request_id`, no timeout of its own.
    pub fn reply(&self, status: StatusCode, result: Value) -> Envelope {
        Envelope {
            sender: self.receiver.clone(),
            receiver: self.sender.clone(),
            timeout_ms: 0,
            event: Event::response(self.request_id(), status, result),
        }
    }

    pub fn reply_error(&self, status: StatusCode, message: impl Into<String>) -> Envelope {
        Envelope {
            sender: self.receiver.clone(),
            receiver: self.sender.clone(),
            timeout_ms: 0,
            event: Event::error_response(self.request_id(), status, message),
        }
    }

    /// Synthetic response used when an outstanding request's envelope
    /// timeout elapses before a reply arrives (spec §4.4 "Handler
    /// correlation").
    pub fn timeout_response(&self) -> Envelope {
        self.reply_error(StatusCode::Timeout, "envelope timed out")
    }

    /// Synthetic response used by a gate when a transmit attempt fails
    /// (spec §4.3 "Outbound connection pool").
    pub fn transmit_error_response(&self, detail: impl Into<String>) -> Envelope {
        self.reply_error(StatusCode::TransmitError, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str) -> Address {
        Address::raw(name)
    }

    #[test]
    fn reply_swaps_sender_and_receiver() {
        let req = Envelope::request(addr("A"), addr("B"), 5, "core.echo", Value::Null, 1000);
        let resp = req.reply(StatusCode::Ok, Value::from("pong"));
        assert_eq!(resp.sender, addr("B"));
        assert_eq!(resp.receiver, addr("A"));
        assert_eq!(resp.request_id(), 5);
        assert_eq!(resp.timeout_ms, 0);
    }

    #[test]
    fn timeout_response_carries_timeout_status() {
        let req = Envelope::request(addr("A"), addr("B"), 9, "core.echo", Value::Null, 50);
        let resp = req.timeout_response();
        assert_eq!(resp.event.status(), Some(StatusCode::Timeout));
        assert_eq!(resp.request_id(), 9);
    }

    #[test]
    fn zero_timeout_means_no_timeout() {
        let req = Envelope::request(addr("A"), addr("B"), 1, "core.echo", Value::Null, 0);
        assert!(!req.has_timeout());
    }
}

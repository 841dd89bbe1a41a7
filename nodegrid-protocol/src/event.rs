//! The tagged request/response union carried inside every
//! [`crate::Envelope`].

use nodegrid_shared::{StatusCode, Value};
use serde::{Deserialize, Serialize};

/// `0` means "no request id" — fire-and-forget, per spec §4.4's "Request
/// IDs: ... `0`/null means fire-and-forget".
pub const NO_REQUEST_ID: i64 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    Request {
        request_id: i64,
        command: String,
        params: Value,
    },
    Response {
        request_id: i64,
        status: StatusCode,
        result: Value,
        error: Option<String>,
        is_response: bool,
    },
}

impl Event {
    pub fn request(request_id: i64, command: impl Into<String>, params: Value) -> Self {
        Event::Request {
            request_id,
            command: command.into(),
            params,
        }
    }

    pub fn response(request_id: i64, status: StatusCode, result: Value) -> Self {
        Event::Response {
            request_id,
            status,
            result,
            error: None,
            is_response: true,
        }
    }

    pub fn error_response(request_id: i64, status: StatusCode, error: impl Into<String>) -> Self {
        Event::Response {
            request_id,
            status,
            result: Value::Null,
            error: Some(error.into()),
            is_response: true,
        }
    }

    pub fn request_id(&self) -> i64 {
        match self {
            Event::Request { request_id, .. } | Event::Response { request_id, .. } => *request_id,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Event::Response { .. })
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Event::Request { .. })
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Event::Request { command, .. } => Some(command),
            Event::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Event::Response { status, .. } => Some(*status),
            Event::Request { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_dotted_command_and_params() {
        let ev = Event::request(7, "core.echo", Value::from("hi"));
        assert_eq!(ev.request_id(), 7);
        assert_eq!(ev.command(), Some("core.echo"));
        assert!(ev.is_request());
    }

    #[test]
    fn fire_and_forget_uses_zero_request_id() {
        let ev = Event::request(NO_REQUEST_ID, "core.flush_events", Value::Null);
        assert_eq!(ev.request_id(), 0);
    }

    #[test]
    fn response_preserves_request_id() {
        let ev = Event::response(7, StatusCode::Ok, Value::from(42i64));
        assert_eq!(ev.request_id(), 7);
        assert!(ev.is_response());
        assert_eq!(ev.status(), Some(StatusCode::Ok));
    }

    #[test]
    fn error_response_carries_message() {
        let ev = Event::error_response(7, StatusCode::UnkMsg, "unknown command");
        match ev {
            Event::Response { error, .. } => assert_eq!(error.as_deref(), Some("unknown command")),
            _ => panic!("expected response"),
        }
    }
}

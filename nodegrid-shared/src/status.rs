//! On-wire status taxonomy (spec §7).
//!
//! `StatusCode` is the value carried on `Event::Response.status`. It is
//! distinct from [`crate::error::NodegridError`], which is the Rust-level
//! error type used by fallible constructors and setup paths. Any
//! `NodegridError` raised inside a module/task dispatch boundary is mapped
//! to the closest `StatusCode` (default `Exception`) rather than allowed to
//! unwind through the scheduler loop.

use serde::{Deserialize, Serialize};

/// Stable wire status codes. Values must never be renumbered — they are
/// persisted in `pqueue`/`job` tables and exchanged across process
/// boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum StatusCode {
    /// Handled.
    Ok = 0,
    /// Pass to next handler.
    Pass = 1,
    /// Module requests task creation.
    TaskReq = 2,
    /// Envelope forwarded; no local response.
    Forwarded = 3,
    /// Unknown command.
    UnkMsg = -1,
    /// Generic error.
    Error = -2,
    /// Handler raised.
    Exception = -3,
    /// Bad input.
    WrongParams = -4,
    /// Capacity reached.
    Overflow = -5,
    /// No such task.
    UnkTask = -6,
    /// Not ready.
    Waiting = -8,
    /// Cancelled.
    UsrAbort = -9,
    /// Configuration error.
    WrongCfg = -10,
    /// Transport: undefined.
    UndefError = -101,
    /// No route.
    UnknownNode = -102,
    /// Network failure.
    TransmitError = -103,
    /// Envelope timed out.
    Timeout = -104,
    /// Gave up.
    RetryOverflow = -105,
}

impl StatusCode {
    pub const fn value(self) -> i32 {
        self as i32
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::Forwarded)
    }

    pub const fn is_error(self) -> bool {
        !self.is_ok() && !matches!(self, StatusCode::Pass | StatusCode::TaskReq)
    }

    pub fn from_value(value: i32) -> Option<Self> {
        Some(match value {
            0 => StatusCode::Ok,
            1 => StatusCode::Pass,
            2 => StatusCode::TaskReq,
            3 => StatusCode::Forwarded,
            -1 => StatusCode::UnkMsg,
            -2 => StatusCode::Error,
            -3 => StatusCode::Exception,
            -4 => StatusCode::WrongParams,
            -5 => StatusCode::Overflow,
            -6 => StatusCode::UnkTask,
            -8 => StatusCode::Waiting,
            -9 => StatusCode::UsrAbort,
            -10 => StatusCode::WrongCfg,
            -101 => StatusCode::UndefError,
            -102 => StatusCode::UnknownNode,
            -103 => StatusCode::TransmitError,
            -104 => StatusCode::Timeout,
            -105 => StatusCode::RetryOverflow,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}({})", self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_defined_value() {
        let all = [
            StatusCode::Ok,
            StatusCode::Pass,
            StatusCode::TaskReq,
            StatusCode::Forwarded,
            StatusCode::UnkMsg,
            StatusCode::Error,
            StatusCode::Exception,
            StatusCode::WrongParams,
            StatusCode::Overflow,
            StatusCode::UnkTask,
            StatusCode::Waiting,
            StatusCode::UsrAbort,
            StatusCode::WrongCfg,
            StatusCode::UndefError,
            StatusCode::UnknownNode,
            StatusCode::TransmitError,
            StatusCode::Timeout,
            StatusCode::RetryOverflow,
        ];
        for code in all {
            assert_eq!(StatusCode::from_value(code.value()), Some(code));
        }
    }

    #[test]
    fn unknown_value_is_none() {
        assert_eq!(StatusCode::from_value(42), None);
    }

    #[test]
    fn ok_and_forwarded_are_non_errors() {
        assert!(StatusCode::Ok.is_ok());
        assert!(StatusCode::Forwarded.is_ok());
        assert!(!StatusCode::Error.is_ok());
    }

    #[test]
    fn pass_and_task_req_are_neither_ok_nor_error() {
        assert!(!StatusCode::Pass.is_error());
        assert!(!StatusCode::Pass.is_ok());
        assert!(!StatusCode::TaskReq.is_error());
    }
}

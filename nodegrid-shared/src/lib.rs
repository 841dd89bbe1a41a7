//! # nodegrid-shared
//!
//! Ambient stack shared by every nodegrid crate: the Rust-level error type,
//! the on-wire status taxonomy, a dynamic parameter value, layered
//! configuration, tracing bootstrap, and the circuit breaker used to
//! protect outbound sends.

pub mod config;
pub mod error;
pub mod logging;
pub mod resilience;
pub mod status;
pub mod value;

pub use config::NodegridConfig;
pub use error::{NodegridError, NodegridResult};
pub use status::StatusCode;
pub use value::Value;

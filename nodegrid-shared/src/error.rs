//! Rust-level error type for nodegrid, separate from the on-wire
//! [`crate::status::StatusCode`] taxonomy (spec §7, §9 "exception-for-control-flow").

use crate::status::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum NodegridError {
    #[error("address parse error at offset {offset}: {message}")]
    AddressParse { offset: usize, message: String },

    #[error("unknown alias: {0}")]
    UnknownAlias(String),

    #[error("registry entry not found for handle {0}")]
    RegistryHandleNotFound(u64),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("wrong parameters: {0}")]
    WrongParams(String),

    #[error("no route to receiver: {0}")]
    UnknownNode(String),

    #[error("gate does not support protocol {0}")]
    UnsupportedProtocol(String),

    #[error("transmit error: {0}")]
    TransmitError(String),

    #[error("envelope timed out after {0}ms")]
    Timeout(u32),

    #[error("request cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigLoad(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl NodegridError {
    /// Map to the closest wire [`StatusCode`], per spec §9's
    /// exception-for-control-flow design note: no error escapes the
    /// dispatch loop, it is always converted at the scheduler boundary.
    pub fn to_status(&self) -> StatusCode {
        match self {
            NodegridError::AddressParse { .. } => StatusCode::WrongParams,
            NodegridError::UnknownAlias(_) => StatusCode::UnknownNode,
            NodegridError::RegistryHandleNotFound(_) => StatusCode::UnkMsg,
            NodegridError::UnknownCommand(_) => StatusCode::UnkMsg,
            NodegridError::WrongParams(_) => StatusCode::WrongParams,
            NodegridError::UnknownNode(_) => StatusCode::UnknownNode,
            NodegridError::UnsupportedProtocol(_) => StatusCode::UndefError,
            NodegridError::TransmitError(_) => StatusCode::TransmitError,
            NodegridError::Timeout(_) => StatusCode::Timeout,
            NodegridError::Cancelled => StatusCode::UsrAbort,
            NodegridError::Config(_) | NodegridError::ConfigLoad(_) => StatusCode::WrongCfg,
            NodegridError::Serde(_) => StatusCode::WrongParams,
            NodegridError::Database(_) => StatusCode::Error,
            NodegridError::Io(_) => StatusCode::Error,
            NodegridError::Other(_) => StatusCode::Exception,
        }
    }
}

pub type NodegridResult<T> = Result<T, NodegridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_timeout_to_timeout_status() {
        let err = NodegridError::Timeout(500);
        assert_eq!(err.to_status(), StatusCode::Timeout);
    }

    #[test]
    fn maps_cancelled_to_usr_abort() {
        assert_eq!(NodegridError::Cancelled.to_status(), StatusCode::UsrAbort);
    }

    #[test]
    fn maps_unknown_command_to_unk_msg() {
        let err = NodegridError::UnknownCommand("foo.bar".into());
        assert_eq!(err.to_status(), StatusCode::UnkMsg);
    }
}

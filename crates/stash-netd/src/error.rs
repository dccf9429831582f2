//! Session error taxonomy.

use stash_netproto::{error::ProtoError, op::Status};
use thiserror::Error;

/// How an error is handled at the session boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed header, oversized field, buffer overflow. Fatal, never retried.
    ProtocolViolation,
    /// Read/write failure, peer reset or an unresponsive peer. Fatal to the
    /// connection; callers may retry with a new one.
    TransportError,
    /// No free port. Reported to the requester, not retried by the gateway.
    ResourceExhausted,
    /// Reported to the peer through a reply frame's status and payload.
    ApplicationError,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(ProtoError),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("no ports available")]
    ResourceExhausted,
    #[error("{status:?}: {message}")]
    Application { status: Status, message: String },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl SessionError {
    pub fn application(status: Status, message: impl Into<String>) -> Self {
        Self::Application {
            status,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Protocol(_) => ErrorClass::ProtocolViolation,
            SessionError::Transport(_) | SessionError::Timeout(_) => ErrorClass::TransportError,
            SessionError::ResourceExhausted => ErrorClass::ResourceExhausted,
            SessionError::Application { .. } => ErrorClass::ApplicationError,
        }
    }
}

impl From<ProtoError> for SessionError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::Io(io) => SessionError::Transport(io),
            other => SessionError::Protocol(other),
        }
    }
}

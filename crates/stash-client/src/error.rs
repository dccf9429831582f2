//! Client error types.

use stash_netproto::{error::ProtoError, op::Status};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed by server")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request rejected ({status:?}): {message}")]
    Rejected { status: Status, message: String },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("gateway returned an invalid port: {0:?}")]
    BadPort(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl ClientError {
    /// Status code carried by a rejection, if this is one.
    pub fn status(&self) -> Option<Status> {
        match self {
            ClientError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("username too long: {0} bytes (max 255)")]
    UsernameTooLong(usize),
    #[error("username is not valid utf-8")]
    InvalidUsername,
    #[error("truncated header")]
    TruncatedHeader,
    #[error("truncated payload: need {needed} bytes, have {available}")]
    TruncatedPayload { needed: usize, available: usize },
    #[error("frame of {needed} bytes overflows {capacity}-byte receive buffer")]
    BufferOverflow { needed: usize, capacity: usize },
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// Malformed or oversized input from the peer. Fatal to the connection and
    /// never retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtoError::InvalidUsername
                | ProtoError::TruncatedHeader
                | ProtoError::TruncatedPayload { .. }
                | ProtoError::BufferOverflow { .. }
        )
    }

    /// Read/write failure on the underlying stream. Callers may retry on a new
    /// connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtoError::Io(_))
    }
}

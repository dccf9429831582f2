use bytes::Bytes;

use crate::{
    codec::encode_frame,
    error::ProtoError,
    header::FrameHeader,
    op::{Operation, Status},
};

/// One complete protocol message with an owned payload.
/// Safe to move across tasks/channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub operation: u8,
    pub status: u8,
    pub username: String,
    pub sequence: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(
        operation: Operation,
        status: Status,
        username: impl Into<String>,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            operation: operation as u8,
            status: status as u8,
            username: username.into(),
            sequence,
            payload: payload.into(),
        }
    }

    pub(crate) fn from_parts(header: FrameHeader, payload: Bytes) -> Self {
        Self {
            operation: header.operation,
            status: header.status,
            username: header.username,
            sequence: header.sequence,
            payload,
        }
    }

    /// `None` for codes this build does not know.
    pub fn op(&self) -> Option<Operation> {
        Operation::from_repr(self.operation)
    }

    pub fn is_final(&self) -> bool {
        self.status == Status::Final as u8
    }

    /// The application error carried by this frame, if any.
    ///
    /// Unknown error codes map to `Status::Internal`.
    pub fn error(&self) -> Option<Status> {
        Status::is_error_code(self.status)
            .then(|| Status::from_repr(self.status).unwrap_or(Status::Internal))
    }

    /// Payload interpreted as a UTF-8 diagnostic or identifier.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            operation: self.operation,
            status: self.status,
            username: self.username.clone(),
            sequence: self.sequence,
            payload_len: self.payload.len() as u32,
        }
    }

    pub fn encode(&self, max_payload: usize) -> Result<Vec<u8>, ProtoError> {
        encode_frame(
            self.operation,
            self.status,
            &self.username,
            self.sequence,
            &self.payload,
            max_payload,
        )
    }
}

/// A frame pulled off a stream, together with the exact bytes it arrived as.
///
/// Relays forward `raw` untouched instead of re-encoding `frame`.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub frame: Frame,
    pub raw: Bytes,
}

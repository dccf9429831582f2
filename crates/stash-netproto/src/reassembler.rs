//! Per-connection frame reassembly.
//!
//! Bytes read from a stream socket are appended to a bounded buffer; complete
//! frames are cut from the front as soon as they are available. The buffer is
//! private state owned by one connection and dropped with it.

use bytes::BytesMut;

use crate::{error::ProtoError, frame::Frame, frame::ReceivedFrame, header::FrameHeader};

/// Accumulates stream bytes and yields complete frames one at a time.
#[derive(Debug)]
pub struct FrameReassembler {
    buf: BytesMut,
    capacity: usize,
}

impl FrameReassembler {
    /// Create a reassembler whose buffer never holds more than `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered (a partial frame, or several whole ones).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Room left before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Mutable access to the buffer for direct socket reads.
    ///
    /// Callers must not grow it past `remaining()` bytes.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Append bytes received from the peer.
    pub fn push(&mut self, data: &[u8]) -> Result<(), ProtoError> {
        let needed = self.buf.len() + data.len();
        if needed > self.capacity {
            return Err(ProtoError::BufferOverflow {
                needed,
                capacity: self.capacity,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Cut the next complete frame off the front of the buffer.
    ///
    /// - `Ok(Some(frame))` when a whole frame was buffered; any bytes after it
    ///   stay for the next call.
    /// - `Ok(None)` when more bytes are needed (header or payload incomplete).
    /// - `Err(BufferOverflow)` when the header declares a frame larger than the
    ///   buffer could ever hold. This is a protocol violation, not retryable.
    pub fn next_frame(&mut self) -> Result<Option<ReceivedFrame>, ProtoError> {
        let header = match FrameHeader::decode(&self.buf) {
            Ok(header) => header,
            Err(ProtoError::TruncatedHeader) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total = header.frame_len();
        if total > self.capacity {
            return Err(ProtoError::BufferOverflow {
                needed: total,
                capacity: self.capacity,
            });
        }
        if self.buf.len() < total {
            return Ok(None);
        }

        let offset = header.payload_offset();
        let raw = self.buf.split_to(total).freeze();
        let payload = raw.slice(offset..total);

        Ok(Some(ReceivedFrame {
            frame: Frame::from_parts(header, payload),
            raw,
        }))
    }

    /// Drain every complete frame currently buffered.
    pub fn drain_frames(&mut self) -> Result<Vec<ReceivedFrame>, ProtoError> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame()? {
            out.push(frame);
        }
        Ok(out)
    }
}

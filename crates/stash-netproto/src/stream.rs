//! Async adapters between tokio byte streams and frames.

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    codec::encode_frame,
    error::ProtoError,
    frame::{Frame, ReceivedFrame},
    header::decode_header,
    op::{Operation, Status},
    reassembler::FrameReassembler,
};

/// Upper bound on a single socket read.
const READ_CHUNK: usize = 4096;

/// Pulls complete frames off an `AsyncRead`.
pub struct FrameReader<R> {
    inner: R,
    framer: FrameReassembler,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            framer: FrameReassembler::new(capacity),
        }
    }

    /// Read until one complete frame is available.
    ///
    /// Returns `Ok(None)` once the peer shuts down its side of the stream on a
    /// frame boundary. A shutdown in the middle of a frame is reported as
    /// `TruncatedHeader` or `TruncatedPayload`.
    pub async fn next_frame(&mut self) -> Result<Option<ReceivedFrame>, ProtoError> {
        loop {
            if let Some(frame) = self.framer.next_frame()? {
                return Ok(Some(frame));
            }

            let room = self.framer.remaining().min(READ_CHUNK);
            if room == 0 {
                return Err(ProtoError::BufferOverflow {
                    needed: self.framer.buffered() + 1,
                    capacity: self.framer.capacity(),
                });
            }

            let buf = self.framer.buf_mut();
            buf.reserve(room);
            let mut limited = buf.limit(room);
            let n = self.inner.read_buf(&mut limited).await?;
            if n == 0 {
                return match self.framer.buffered() {
                    0 => Ok(None),
                    _ => Err(self.truncated()),
                };
            }
        }
    }

    fn truncated(&mut self) -> ProtoError {
        let buf = self.framer.buf_mut();
        match decode_header(&buf[..]) {
            Ok(header) => ProtoError::TruncatedPayload {
                needed: header.payload_len as usize,
                available: buf.len() - header.payload_offset(),
            },
            Err(e) => e,
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.framer.buffered()
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Encodes frames for one session owner onto an `AsyncWrite`.
pub struct FrameWriter<W> {
    inner: W,
    username: String,
    max_payload: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, username: impl Into<String>, max_payload: usize) -> Self {
        Self {
            inner,
            username: username.into(),
            max_payload,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode and write one frame.
    pub async fn send(
        &mut self,
        op: Operation,
        status: Status,
        sequence: u32,
        payload: &[u8],
    ) -> Result<(), ProtoError> {
        let bytes = encode_frame(
            op as u8,
            status as u8,
            &self.username,
            sequence,
            payload,
            self.max_payload,
        )?;
        self.inner.write_all(&bytes).await?;
        Ok(())
    }

    /// Write a frame as-is, including its own username.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), ProtoError> {
        let bytes = frame.encode(self.max_payload)?;
        self.inner.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ProtoError> {
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtoError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

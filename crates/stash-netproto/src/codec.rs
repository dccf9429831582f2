use bytes::Bytes;

use crate::{constants::MAX_USERNAME_LEN, error::ProtoError, frame::Frame, header::FrameHeader};

/// Encode one frame.
///
/// Produces exactly `3 + username.len() + 4 + 4 + payload.len()` bytes.
/// Fails with `PayloadTooLarge` if `payload` exceeds `max_payload` and with
/// `UsernameTooLong` if `username` exceeds 255 bytes.
pub fn encode_frame(
    operation: u8,
    status: u8,
    username: &str,
    sequence: u32,
    payload: &[u8],
    max_payload: usize,
) -> Result<Vec<u8>, ProtoError> {
    if payload.len() > max_payload {
        return Err(ProtoError::PayloadTooLarge {
            len: payload.len(),
            max: max_payload,
        });
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(ProtoError::UsernameTooLong(username.len()));
    }

    let header = FrameHeader {
        operation,
        status,
        username: username.to_owned(),
        sequence,
        payload_len: payload.len() as u32,
    };

    let mut out = Vec::with_capacity(header.frame_len());
    header.encode_into(&mut out)?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Copy exactly `length` payload bytes from the start of `buf`.
pub fn decode_payload(buf: &[u8], length: usize) -> Result<Bytes, ProtoError> {
    let bytes = buf.get(..length).ok_or(ProtoError::TruncatedPayload {
        needed: length,
        available: buf.len(),
    })?;
    Ok(Bytes::copy_from_slice(bytes))
}

/// Decode one complete frame from the start of `buf`.
///
/// Returns the frame and the number of bytes it occupied. Trailing bytes
/// (the start of the next frame) are left alone.
pub fn decode_frame(buf: &[u8]) -> Result<(Frame, usize), ProtoError> {
    let header = FrameHeader::decode(buf)?;
    let offset = header.payload_offset();
    let payload = decode_payload(&buf[offset..], header.payload_len as usize)?;
    let consumed = header.frame_len();
    Ok((Frame::from_parts(header, payload), consumed))
}

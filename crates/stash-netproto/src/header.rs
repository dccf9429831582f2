use crate::{
    constants::{MAX_USERNAME_LEN, MIN_HEADER_LEN, PREFIX_LEN, TRAILER_LEN},
    error::ProtoError,
    op::{Operation, Status},
};

/// Frame header (wire format).
///
/// Encoding rules:
/// - Variable size: `11 + username.len()` bytes.
/// - Integer fields are big-endian.
/// - The username is not NUL-terminated; its length prefix is one byte.
///
/// Decode rules:
/// - Requires at least `MIN_HEADER_LEN` bytes.
/// - Requires the declared username (and the 8 bytes after it) to be present.
/// - Does not look at the payload; `payload_offset()`/`frame_len()` tell the
///   caller how many bytes the complete frame needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw operation code. `decode()` does not validate it; unknown codes are
    /// left for upper layers to log and skip.
    pub operation: u8,

    /// Raw status byte (see [`Status`]).
    pub status: u8,

    /// Session owner. At most 255 bytes of UTF-8.
    pub username: String,

    /// Per-direction frame counter within one exchange.
    pub sequence: u32,

    /// Payload length in bytes.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Encoded header size in bytes.
    pub fn header_len(&self) -> usize {
        PREFIX_LEN + self.username.len() + TRAILER_LEN
    }

    /// Offset of the first payload byte, relative to the frame start.
    pub fn payload_offset(&self) -> usize {
        self.header_len()
    }

    /// Total encoded frame length (header + payload).
    pub fn frame_len(&self) -> usize {
        self.header_len().saturating_add(self.payload_len as usize)
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_repr(self.operation)
    }

    pub fn is_final(&self) -> bool {
        self.status == Status::Final as u8
    }

    /// Append the encoded header to `out`.
    ///
    /// Offsets (bytes):
    /// - 0              operation
    /// - 1              status
    /// - 2              username_len (n)
    /// - 3..3+n         username
    /// - 3+n..7+n       sequence (u32 BE)
    /// - 7+n..11+n      payload_len (u32 BE)
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), ProtoError> {
        let name = self.username.as_bytes();
        if name.len() > MAX_USERNAME_LEN {
            return Err(ProtoError::UsernameTooLong(name.len()));
        }

        out.reserve(self.header_len());
        out.push(self.operation);
        out.push(self.status);
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.payload_len.to_be_bytes());
        Ok(())
    }

    /// Decode the header at the start of `buf`.
    ///
    /// `buf` may hold more than one frame, or only part of one:
    /// - Fewer than `MIN_HEADER_LEN` bytes, or a username running past the
    ///   end of `buf`, returns `TruncatedHeader` (the caller should read more).
    /// - A username that is not UTF-8 returns `InvalidUsername`.
    pub fn decode(buf: &[u8]) -> Result<FrameHeader, ProtoError> {
        if buf.len() < MIN_HEADER_LEN {
            return Err(ProtoError::TruncatedHeader);
        }

        let operation = buf[0];
        let status = buf[1];
        let name_len = buf[2] as usize;

        let name_end = PREFIX_LEN + name_len;
        if buf.len() < name_end + TRAILER_LEN {
            return Err(ProtoError::TruncatedHeader);
        }

        let username = std::str::from_utf8(&buf[PREFIX_LEN..name_end])
            .map_err(|_| ProtoError::InvalidUsername)?
            .to_owned();
        let sequence = read_u32_be(buf, name_end)?;
        let payload_len = read_u32_be(buf, name_end + 4)?;

        Ok(FrameHeader {
            operation,
            status,
            username,
            sequence,
            payload_len,
        })
    }
}

/// Decode the header at the start of `buf` without touching the payload.
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, ProtoError> {
    FrameHeader::decode(buf)
}

fn read_u32_be(buf: &[u8], start: usize) -> Result<u32, ProtoError> {
    let bytes: [u8; 4] = buf
        .get(start..start + 4)
        .ok_or(ProtoError::TruncatedHeader)?
        .try_into()
        .map_err(|_| ProtoError::TruncatedHeader)?;
    Ok(u32::from_be_bytes(bytes))
}

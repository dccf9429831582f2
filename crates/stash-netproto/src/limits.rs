//! Size limits shared by encoders, reassemblers and servers.

use crate::constants::MAX_HEADER_LEN;

/// Default maximum payload carried by a single frame.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024;

/// Default per-connection accumulation buffer.
pub const DEFAULT_RX_BUFFER: usize = 8 * 1024;

/// Per-connection size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest payload an encoder will accept. Exceeding it is a construction
    /// error, never a transport error.
    pub max_payload: usize,
    /// Capacity of the reassembly buffer. A frame whose declared total length
    /// exceeds it is a protocol violation.
    pub rx_buffer: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            rx_buffer: DEFAULT_RX_BUFFER,
        }
    }
}

impl Limits {
    /// Largest frame an encoder bound by these limits can produce.
    pub const fn max_frame_len(&self) -> usize {
        MAX_HEADER_LEN + self.max_payload
    }

    /// True when every frame this side may legally send also fits in a peer's
    /// reassembly buffer of the same size.
    pub const fn is_consistent(&self) -> bool {
        self.max_frame_len() <= self.rx_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_fit_in_rx_buffer() {
        let limits = Limits::default();
        assert_eq!(limits.max_payload, 1024);
        assert_eq!(limits.rx_buffer, 8192);
        assert!(limits.is_consistent());
    }

    #[test]
    fn oversized_payload_limit_is_inconsistent() {
        let limits = Limits {
            max_payload: 8192,
            rx_buffer: 8192,
        };
        assert!(!limits.is_consistent());
    }
}

/// Leading fixed-size fields: operation, status, username length.
pub const PREFIX_LEN: usize = 3;

/// Sequence number + payload length, following the username.
pub const TRAILER_LEN: usize = 8;

/// Smallest possible header (empty username). Fewer buffered bytes than this
/// can never resolve the payload length.
pub const MIN_HEADER_LEN: usize = PREFIX_LEN + TRAILER_LEN;

/// Usernames are length-prefixed by a single byte.
pub const MAX_USERNAME_LEN: usize = u8::MAX as usize;

/// Largest possible header (255-byte username).
pub const MAX_HEADER_LEN: usize = PREFIX_LEN + MAX_USERNAME_LEN + TRAILER_LEN;

/// Well-known port of the gateway where clients send port requests.
pub const GATEWAY_PORT: u16 = 8080;

/// Default port of the storage backend behind the gateway.
pub const STORAGE_PORT: u16 = 8081;

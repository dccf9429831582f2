use strum::FromRepr;

/// Operation codes carried in the first byte of every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
pub enum Operation {
    /// Ask the gateway for an ephemeral session port.
    PortRequest = 0,
    Login = 1,
    /// Payload: `name|timestamp`.
    StartBackup = 2,
    WriteChunk = 3,
    ListBackups = 4,
    /// Payload: artifact name.
    FetchBackup = 5,
}

/// Frame status byte.
///
/// `Continue` and `Final` drive exchange termination; every other value is an
/// application error code whose payload carries a UTF-8 diagnostic.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
pub enum Status {
    Continue = 0,
    Final = 1,
    LoginFailed = 2,
    NotAuthenticated = 3,
    NotFound = 4,
    CannotCreateArtifact = 5,
    NoPortsAvailable = 6,
    BadRequest = 7,
    Internal = 8,
}

impl Status {
    /// Raw status values above `Final` are reserved for error codes, including
    /// ones this build does not know about.
    pub const fn is_error_code(raw: u8) -> bool {
        raw > Status::Final as u8
    }

    pub const fn is_error(self) -> bool {
        Self::is_error_code(self as u8)
    }
}

//! Stash client library
//!
//! Connects to a backup gateway (or a storage server directly), logs in and
//! runs one backup, list or fetch per session.
//!
//! - [`session`]: port negotiation and the authenticated session
//! - [`config`]: connection settings
//! - [`error`]: error types

pub mod config;
pub mod error;
pub mod session;

pub use config::{ClientConfig, Route};
pub use error::ClientError;
pub use session::{BackupReceipt, SessionClient, negotiate_port};

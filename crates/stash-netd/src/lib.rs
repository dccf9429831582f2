//! Gateway and storage server library - connection loops extracted for testing.

pub mod backup;
pub mod config;
pub mod error;
pub mod gateway;
pub mod net;
pub mod storage;

pub use backup::BackupService;
pub use config::{GatewayConfig, StorageConfig};
pub use error::{ErrorClass, SessionError};
pub use gateway::{Gateway, SessionInfo, SessionPhase, Upstream, run_gateway};
pub use storage::{run_storage_listener, run_storage_server};

//! Backup service: authentication, artifact storage and the per-connection
//! state machine.

pub mod credentials;
pub mod session;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use stash_netproto::limits::Limits;

use crate::config::StorageConfig;

use credentials::CredentialStore;
use store::ArtifactStore;

/// State shared by every backup session of one server.
pub struct BackupService {
    store: ArtifactStore,
    credentials: Arc<dyn CredentialStore>,
    limits: Limits,
    idle_timeout: Duration,
}

impl BackupService {
    pub fn new(
        store: ArtifactStore,
        credentials: Arc<dyn CredentialStore>,
        limits: Limits,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            credentials,
            limits,
            idle_timeout,
        }
    }

    /// Service rooted at `config.root`, using `config`'s limits and idle timeout.
    pub fn from_config(config: &StorageConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        Self::new(
            ArtifactStore::new(&config.root),
            credentials,
            config.limits,
            config.idle_timeout,
        )
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn credentials(&self) -> &dyn CredentialStore {
        self.credentials.as_ref()
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl std::fmt::Debug for BackupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupService")
            .field("store", &self.store)
            .field("limits", &self.limits)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

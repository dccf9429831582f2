//! On-disk artifact store.
//!
//! Layout: `<root>/<username>/<artifact>`. Each upload writes its own
//! `<artifact>.<n>.partial` file and is renamed into place only once the
//! end-of-file chunk arrives, so a listing never shows a half-written artifact.
//! Concurrent uploads of one name never share a file; the last to finish wins.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const PARTIAL_SUFFIX: &str = ".partial";

static NEXT_UPLOAD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid {kind} {value:?}")]
    InvalidName { kind: &'static str, value: String },
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Name and optional timestamp carried by a start-backup payload
/// (`name` or `name|timestamp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupId {
    pub name: String,
    pub timestamp: Option<String>,
}

impl BackupId {
    pub fn parse(payload: &[u8]) -> Result<Self, StoreError> {
        let text = std::str::from_utf8(payload).map_err(|_| StoreError::InvalidName {
            kind: "artifact name",
            value: String::from_utf8_lossy(payload).into_owned(),
        })?;
        let (name, timestamp) = match text.split_once('|') {
            Some((name, ts)) => (name, Some(ts.to_string())),
            None => (text, None),
        };
        validate_component("artifact name", name)?;
        Ok(Self {
            name: name.to_string(),
            timestamp,
        })
    }
}

/// Accept exactly one normal path component. Rejects separators, `.`/`..`,
/// NULs and names that collide with in-progress uploads.
fn validate_component<'a>(kind: &'static str, value: &'a str) -> Result<&'a str, StoreError> {
    let invalid = || StoreError::InvalidName {
        kind,
        value: value.to_string(),
    };

    if value.is_empty() || value.contains(['/', '\\', '\0']) || value.ends_with(PARTIAL_SUFFIX) {
        return Err(invalid());
    }
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == value => Ok(value),
        _ => Err(invalid()),
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, username: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(validate_component("username", username)?))
    }

    /// Create a fresh `<root>/<user>/<name>.<n>.partial` for writing. Existing
    /// files are never opened, so a stale partial is skipped rather than reused.
    pub async fn begin_upload(&self, username: &str, id: &BackupId) -> Result<Upload, StoreError> {
        let dir = self.user_dir(username)?;
        let name = validate_component("artifact name", &id.name)?;
        fs::create_dir_all(&dir).await?;

        let target = dir.join(name);
        let (partial, file) = loop {
            let n = NEXT_UPLOAD_ID.fetch_add(1, Ordering::Relaxed);
            let partial = dir.join(format!("{name}.{n}{PARTIAL_SUFFIX}"));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&partial)
                .await
            {
                Ok(file) => break (partial, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        };
        debug!(path = %partial.display(), "Upload started");

        Ok(Upload {
            file,
            partial,
            target,
            written: 0,
        })
    }

    /// Completed artifacts for `username`, sorted by name. A user with no
    /// directory yet simply has no artifacts.
    pub async fn list(&self, username: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.user_dir(username)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.ends_with(PARTIAL_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn open(&self, username: &str, name: &str) -> Result<File, StoreError> {
        let path = self.user_dir(username)?.join(validate_component("artifact name", name)?);
        match File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// An artifact being written.
#[derive(Debug)]
pub struct Upload {
    file: File,
    partial: PathBuf,
    target: PathBuf,
    written: u64,
}

impl Upload {
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub async fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Flush and move the artifact into place. Returns the number of bytes stored.
    pub async fn finish(mut self) -> io::Result<u64> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.partial, &self.target).await?;
        debug!(path = %self.target.display(), bytes = self.written, "Upload committed");
        Ok(self.written)
    }

    /// Drop the partial artifact.
    pub async fn discard(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.partial).await {
            debug!(path = %self.partial.display(), error = %e, "Removing partial upload failed");
        }
    }
}

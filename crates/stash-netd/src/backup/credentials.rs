//! Login verification.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

/// Checks a username/password pair presented in a login frame.
pub trait CredentialStore: Send + Sync {
    fn verify(&self, username: &str, password: &[u8]) -> bool;
}

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read credentials: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: expected `user:password`")]
    Malformed { line: usize },
}

/// In-memory user table, optionally loaded from a `user:password` file.
///
/// Blank lines and lines starting with `#` are ignored.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.insert(username, password);
        self
    }

    pub fn insert(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.users.insert(username.into(), password.into());
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn parse(text: &str) -> Result<Self, CredentialsError> {
        let mut creds = Self::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((user, password)) if !user.is_empty() => creds.insert(user, password),
                _ => return Err(CredentialsError::Malformed { line: idx + 1 }),
            }
        }
        Ok(creds)
    }

    pub fn load(path: &Path) -> Result<Self, CredentialsError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }
}

impl CredentialStore for StaticCredentials {
    fn verify(&self, username: &str, password: &[u8]) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected.as_bytes() == password)
    }
}

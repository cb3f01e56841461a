//! Persisted credential store for the current user.
//!
//! ARCHITECTURE
//! ============
//! Every component that needs the bearer token or user id goes through
//! this one interface. Centralizing access is what guarantees the fatal
//! auth-failure invariant: any auth/token error path calls [`SessionStore::clear`]
//! exactly once and nothing keeps a stale copy of the credentials.
//!
//! The CLI backs the store with a small JSON file (the stand-in for the
//! browser-local storage of the original views); tests use the in-memory
//! form.

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Error raised by session persistence.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The credentials written at login and erased at logout or on any
/// fatal auth failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Bearer token as returned by the login endpoint.
    pub token: String,
    /// Identifier of the logged-in user.
    pub user_id: String,
}

/// Single session-management interface over the persisted credentials.
#[derive(Debug)]
pub struct SessionStore {
    path: Option<PathBuf>,
    credentials: Option<Credentials>,
}

impl SessionStore {
    /// Open a file-backed store, loading credentials if the file exists.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or parsed.
    pub fn open(path: PathBuf) -> Result<Self, SessionError> {
        let credentials = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            Some(serde_json::from_str(&raw)?)
        } else {
            None
        };
        Ok(Self { path: Some(path), credentials })
    }

    /// Create a store with no persistence, for tests and ephemeral use.
    #[must_use]
    pub fn in_memory() -> Self {
        Self { path: None, credentials: None }
    }

    /// Create an in-memory store that is already logged in.
    #[must_use]
    pub fn with_credentials(token: &str, user_id: &str) -> Self {
        Self {
            path: None,
            credentials: Some(Credentials {
                token: token.to_owned(),
                user_id: user_id.to_owned(),
            }),
        }
    }

    /// Whether credentials are present.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.credentials.is_some()
    }

    /// The logged-in user id, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.user_id.as_str())
    }

    /// The stored token with a guaranteed `Bearer ` prefix, if logged in.
    #[must_use]
    pub fn bearer(&self) -> Option<String> {
        let token = &self.credentials.as_ref()?.token;
        if token.starts_with("Bearer ") {
            Some(token.clone())
        } else {
            Some(format!("Bearer {token}"))
        }
    }

    /// Write new credentials, persisting them when file-backed.
    ///
    /// # Errors
    ///
    /// Fails when the backing file cannot be written.
    pub fn save(&mut self, token: &str, user_id: &str) -> Result<(), SessionError> {
        let credentials = Credentials {
            token: token.to_owned(),
            user_id: user_id.to_owned(),
        };
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            fs::write(path, serde_json::to_vec_pretty(&credentials)?)?;
        }
        self.credentials = Some(credentials);
        Ok(())
    }

    /// Erase the credentials, removing the backing file when present.
    ///
    /// # Errors
    ///
    /// Fails when the backing file exists but cannot be removed.
    pub fn clear(&mut self) -> Result<(), SessionError> {
        self.credentials = None;
        if let Some(path) = &self.path {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

//! Object storage port.
//!
//! The error type carries the transient/non-transient classification the
//! upload coordinator's retry policy depends on: DNS, connection and
//! timeout failures are worth retrying with backoff, auth and bad-request
//! failures are not.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("DNS resolution failed for {host}")]
    Dns { host: String },

    #[error("upload timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authorization failed: {0}")]
    Auth(String),

    #[error("rejected request: {0}")]
    Rejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl StorageError {
    /// Whether retrying the same operation can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Dns { .. } | StorageError::Timeout | StorageError::Connection(_)
        )
    }
}

/// An object as stored, with enough metadata to reference it later.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub file_id: String,
    pub file_name: String,
    /// Public-facing URL, when the bucket exposes one.
    pub url: Option<String>,
    pub size: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload one local file under the given key. Implementations own
    /// authorization caching, endpoint resolution checks and the hard
    /// per-upload timeout; callers own retries.
    async fn upload_file(&self, local_path: &Path, key: &str)
        -> Result<StoredObject, StorageError>;
}

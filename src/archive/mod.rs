//! Durable archive of compressed exports in object storage

#[cfg(feature = "aws")]
pub mod s3;

#[cfg(feature = "aws")]
pub use s3::{S3ObjectStore, S3Options};

use crate::error::{Result, UploadError};
use crate::resilience::{RetryConfig, RetryExecutor, RetryOutcome};
use crate::retention::RetentionTarget;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const GZIP_CONTENT_TYPE: &str = "application/x-gzip";

/// An object as listed by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveObject {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Reference to a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    pub etag: Option<String>,
}

/// Everything needed to store one local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    pub content_type: String,
    pub acl_private: bool,
    /// User metadata stored with the object
    pub metadata: HashMap<String, String>,
}

/// Object storage operations
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ArchiveObject>>;

    async fn put_object(&self, request: &UploadRequest) -> std::result::Result<ObjectRef, UploadError>;

    async fn delete_object(&self, object: &ObjectRef) -> Result<()>;
}

/// Result of [`ArchiveUploader::upload`]. A failed upload never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { object: ObjectRef, attempts: usize },
    Failed { error: UploadError, attempts: usize },
}

impl UploadOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, UploadOutcome::Uploaded { .. })
    }

    pub fn attempts(&self) -> usize {
        match self {
            UploadOutcome::Uploaded { attempts, .. } | UploadOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Hex SHA-256 of a file, read in chunks
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Uploads archives with bounded retry
pub struct ArchiveUploader {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
}

impl ArchiveUploader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            retry: RetryExecutor::new(RetryConfig::default()),
        }
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    /// Stores `local_path` under `bucket`/`key`.
    ///
    /// Transport failures are retried up to the configured attempt count
    /// (3 by default, no delay). Rejections are not retried. Either way the
    /// final failure is returned as [`UploadOutcome::Failed`], not raised.
    #[instrument(skip(self, local_path), fields(path = %local_path.display()))]
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        content_type: &str,
        acl_private: bool,
    ) -> UploadOutcome {
        let path = local_path.to_path_buf();
        let checksum = match tokio::task::spawn_blocking(move || file_sha256(&path)).await {
            Ok(Ok(sum)) => sum,
            Ok(Err(e)) => return Self::unreadable(local_path, e.to_string()),
            Err(e) => return Self::unreadable(local_path, e.to_string()),
        };

        let request = UploadRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            local_path: local_path.to_path_buf(),
            content_type: content_type.to_string(),
            acl_private,
            metadata: HashMap::from([("sha256".to_string(), checksum)]),
        };

        let store = &self.store;
        let request = &request;
        let outcome = self
            .retry
            .execute(
                |attempt| async move {
                    if attempt > 1 {
                        warn!(attempt = attempt, "Retrying archive upload");
                    }
                    store.put_object(request).await
                },
                UploadError::is_retryable,
            )
            .await;

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                info!(bucket = %bucket, key = %key, attempts = attempts, "Archive uploaded");
                UploadOutcome::Uploaded { object: value, attempts }
            }
            RetryOutcome::Exhausted { error, attempts } | RetryOutcome::Aborted { error, attempts } => {
                error!(bucket = %bucket, key = %key, attempts = attempts, error = %error, "Archive upload failed");
                UploadOutcome::Failed { error, attempts }
            }
        }
    }

    fn unreadable(path: &Path, message: String) -> UploadOutcome {
        error!(path = %path.display(), error = %message, "Cannot read archive for upload");
        UploadOutcome::Failed {
            error: UploadError::Io(message),
            attempts: 0,
        }
    }
}

/// Archives of one source instance, ordered by last-modified time
pub struct ArchiveObjects {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ArchiveObjects {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl RetentionTarget for ArchiveObjects {
    type Entry = ArchiveObject;
    type Key = DateTime<Utc>;

    fn target_name(&self) -> &str {
        "archive-objects"
    }

    async fn list(&self) -> Result<Vec<ArchiveObject>> {
        self.store.list_objects(&self.bucket, &self.prefix).await
    }

    fn ordering_key(&self, entry: &ArchiveObject) -> DateTime<Utc> {
        entry.last_modified
    }

    fn label(&self, entry: &ArchiveObject) -> String {
        entry.key.clone()
    }

    async fn delete(&self, entry: &ArchiveObject) -> Result<()> {
        self.store
            .delete_object(&ObjectRef {
                bucket: self.bucket.clone(),
                key: entry.key.clone(),
                etag: None,
            })
            .await
    }
}

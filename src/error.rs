//! Error taxonomy for a backup run

use std::time::Duration;
use thiserror::Error;

/// Result type for rdsdump operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for a backup run
#[derive(Error, Debug)]
pub enum BackupError {
    /// Request rejected by the managed-instance or storage API
    #[error("Provider error: {0}")]
    Provider(String),

    /// Instance did not become available within the bound
    #[error("Instance {instance} not available after {waited:?}")]
    Timeout { instance: String, waited: Duration },

    /// Dump, load or compression step failed
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Object storage request failed outside of the upload retry loop
    #[error("Storage error: {0}")]
    Storage(String),

    /// Backup-mirror host query failed
    #[error("Mirror host error: {0}")]
    Mirror(String),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or malformed configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// DNS provider or public IP lookup failed
    #[error("DNS error: {0}")]
    Dns(String),
}

/// An external process failed or could not be started.
///
/// `exit_code` is `None` when the process was not found, was killed by a
/// signal, or when the step failed before a process produced a status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{tool} failed (exit code {exit_code:?}): {message}")]
pub struct ToolError {
    pub tool: String,
    pub exit_code: Option<i32>,
    pub message: String,
}

impl ToolError {
    pub fn new(tool: impl Into<String>, exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            exit_code,
            message: message.into(),
        }
    }

    pub fn not_found(tool: impl Into<String>) -> Self {
        let tool = tool.into();
        let message = format!("command not found: {}", tool);
        Self::new(tool, None, message)
    }
}

/// Failure of a single upload attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Connection reset, timeout, throttling or a 5xx response
    #[error("Transport error: {0}")]
    Transport(String),

    /// The store refused the request (credentials, missing bucket, policy)
    #[error("Upload rejected: {0}")]
    Rejected(String),

    /// The local archive could not be read
    #[error("IO error: {0}")]
    Io(String),
}

impl UploadError {
    /// Only transport-level failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transport(_))
    }
}

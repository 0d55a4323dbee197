//! Export from the restored instance and import into the mirror host
//!
//! Both directions stream through a file on disk, never through memory,
//! since dump sizes are unbounded. The dump/load programs are run as child
//! processes; their failures surface as [`ToolError`].

pub mod compress;

pub use compress::{Compressor, GzipCompressor};

use crate::error::ToolError;
use async_trait::async_trait;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{error, info, instrument};

/// Where and as whom to connect for a dump or an import
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Dump and load operations
#[async_trait]
pub trait DatabaseTools: Send + Sync {
    /// Writes a transactionally consistent dump of `database` to `output`
    async fn dump(&self, source: &ConnectionParams, database: &str, output: &Path) -> Result<(), ToolError>;

    /// Loads `input` into the existing `database`
    async fn import(&self, target: &ConnectionParams, database: &str, input: &Path) -> Result<(), ToolError>;
}

/// `mysqldump` / `mysql` command line clients
#[derive(Debug, Clone)]
pub struct MysqlTools {
    mysqldump_bin: String,
    mysql_bin: String,
}

impl Default for MysqlTools {
    fn default() -> Self {
        Self::new("mysqldump", "mysql")
    }
}

impl MysqlTools {
    pub fn new(mysqldump_bin: impl Into<String>, mysql_bin: impl Into<String>) -> Self {
        Self {
            mysqldump_bin: mysqldump_bin.into(),
            mysql_bin: mysql_bin.into(),
        }
    }

    fn connection_args(conn: &ConnectionParams) -> Vec<String> {
        vec![
            "-h".to_string(),
            conn.host.clone(),
            "-P".to_string(),
            conn.port.to_string(),
            "-u".to_string(),
            conn.username.clone(),
        ]
    }

    async fn run(tool: &str, mut command: Command) -> Result<(), ToolError> {
        let output = command.output().await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ToolError::not_found(tool)
            } else {
                ToolError::new(tool, None, format!("failed to start: {}", e))
            }
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let err = ToolError::new(tool, output.status.code(), stderr);
        error!(tool = %tool, exit_code = ?err.exit_code, message = %err.message, "External tool failed");
        Err(err)
    }
}

#[async_trait]
impl DatabaseTools for MysqlTools {
    #[instrument(skip(self, source), fields(host = %source.host))]
    async fn dump(&self, source: &ConnectionParams, database: &str, output: &Path) -> Result<(), ToolError> {
        let file = std::fs::File::create(output).map_err(|e| {
            ToolError::new(&self.mysqldump_bin, None, format!("cannot create {}: {}", output.display(), e))
        })?;

        let mut command = Command::new(&self.mysqldump_bin);
        command
            .args(["--opt", "--add-drop-table", "--single-transaction", "--order-by-primary"])
            .args(Self::connection_args(source))
            .arg(database)
            .env("MYSQL_PWD", &source.password)
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped());

        Self::run(&self.mysqldump_bin, command).await?;
        info!(database = %database, path = %output.display(), "Dump written");
        Ok(())
    }

    #[instrument(skip(self, target), fields(host = %target.host))]
    async fn import(&self, target: &ConnectionParams, database: &str, input: &Path) -> Result<(), ToolError> {
        let file = std::fs::File::open(input).map_err(|e| {
            ToolError::new(&self.mysql_bin, None, format!("cannot open {}: {}", input.display(), e))
        })?;

        let mut command = Command::new(&self.mysql_bin);
        command
            .args(Self::connection_args(target))
            .arg(database)
            .env("MYSQL_PWD", &target.password)
            .stdin(Stdio::from(file))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        Self::run(&self.mysql_bin, command).await?;
        info!(database = %database, path = %input.display(), "Import finished");
        Ok(())
    }
}

/// The on-disk export of this run and its compressed counterpart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub database: String,
    pub export_path: PathBuf,
    pub archive_path: PathBuf,
}

/// Files removed (or not) during cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCleanup {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl ExportArtifact {
    pub fn new(database: impl Into<String>, export_path: PathBuf, archive_path: PathBuf) -> Self {
        Self {
            database: database.into(),
            export_path,
            archive_path,
        }
    }

    pub fn export_exists(&self) -> bool {
        self.export_path.exists()
    }

    pub fn archive_exists(&self) -> bool {
        self.archive_path.exists()
    }

    /// Deletes both files if present. Absent files are not an error.
    pub async fn remove_files(&self) -> FileCleanup {
        let mut cleanup = FileCleanup::default();
        for path in [&self.export_path, &self.archive_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => cleanup.removed.push(path.clone()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to remove local file");
                    cleanup.failed.push((path.clone(), e.to_string()));
                }
            }
        }
        cleanup
    }
}

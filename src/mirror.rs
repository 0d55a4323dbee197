//! Backup-mirror host: receives an imported copy of every run

use crate::error::{BackupError, Result};
use crate::naming::TIMESTAMP_FORMAT;
use crate::pipeline::ConnectionParams;
use crate::retention::RetentionTarget;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use regex::Regex;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, info};

/// Database administration on the mirror host
#[async_trait]
pub trait MirrorHost: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Drops `name` if it exists and creates it empty
    async fn recreate_database(&self, name: &str) -> Result<()>;

    async fn drop_database(&self, name: &str) -> Result<()>;
}

/// Backtick-quotes a MySQL identifier
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// MySQL server reached through sqlx
pub struct MySqlMirrorHost {
    pool: MySqlPool,
}

impl MySqlMirrorHost {
    /// Connections are opened on first use
    pub fn connect_lazy(params: &ConnectionParams) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.username)
            .password(&params.password);

        let pool = MySqlPoolOptions::new().max_connections(1).connect_lazy_with(options);
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| BackupError::Mirror(format!("{}: {}", sql, e)))?;
        Ok(())
    }
}

#[async_trait]
impl MirrorHost for MySqlMirrorHost {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SHOW DATABASES")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackupError::Mirror(format!("Failed to list databases: {}", e)))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>(0)
                    .map_err(|e| BackupError::Mirror(format!("Unexpected SHOW DATABASES row: {}", e)))
            })
            .collect()
    }

    async fn recreate_database(&self, name: &str) -> Result<()> {
        let quoted = quote_identifier(name);
        self.execute(&format!("DROP DATABASE IF EXISTS {}", quoted)).await?;
        self.execute(&format!("CREATE DATABASE {}", quoted)).await?;
        info!(database = %name, "Mirror database created");
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.execute(&format!("DROP DATABASE IF EXISTS {}", quote_identifier(name))).await
    }
}

/// A run's database on the mirror host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorDatabase {
    pub name: String,
    pub created_at: NaiveDateTime,
}

/// Mirror databases sharing one prefix, ordered by the timestamp in their name.
///
/// Names whose suffix is not a `YYYYMMDDHHMMSS` timestamp are left alone.
pub struct MirrorDatabases {
    host: Arc<dyn MirrorHost>,
    pattern: Regex,
}

impl MirrorDatabases {
    pub fn new(host: Arc<dyn MirrorHost>, prefix: &str) -> Result<Self> {
        let pattern = Regex::new(&format!(r"^{}(\d{{14}})$", regex::escape(prefix)))
            .map_err(|e| BackupError::Config(format!("Invalid mirror prefix {:?}: {}", prefix, e)))?;
        Ok(Self { host, pattern })
    }

    pub fn parse(&self, name: &str) -> Option<MirrorDatabase> {
        let captures = self.pattern.captures(name)?;
        let created_at = NaiveDateTime::parse_from_str(&captures[1], TIMESTAMP_FORMAT).ok()?;
        Some(MirrorDatabase {
            name: name.to_string(),
            created_at,
        })
    }
}

#[async_trait]
impl RetentionTarget for MirrorDatabases {
    type Entry = MirrorDatabase;
    type Key = NaiveDateTime;

    fn target_name(&self) -> &str {
        "mirror-databases"
    }

    async fn list(&self) -> Result<Vec<MirrorDatabase>> {
        let names = self.host.list_databases().await?;
        Ok(names
            .iter()
            .filter_map(|name| {
                let parsed = self.parse(name);
                if parsed.is_none() {
                    debug!(database = %name, "Not a timestamped mirror database, ignoring");
                }
                parsed
            })
            .collect())
    }

    fn ordering_key(&self, entry: &MirrorDatabase) -> NaiveDateTime {
        entry.created_at
    }

    fn label(&self, entry: &MirrorDatabase) -> String {
        entry.name.clone()
    }

    async fn delete(&self, entry: &MirrorDatabase) -> Result<()> {
        self.host.drop_database(&entry.name).await
    }
}

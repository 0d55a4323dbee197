//! Run configuration: compiled defaults < defaults file < explicit options

use crate::dns::{RecordSet, DEFAULT_IP_ECHO_URL};
use crate::error::{BackupError, Result};
use crate::instance::{LifecycleConfig, PlacementOptions};
use crate::pipeline::ConnectionParams;
use crate::resilience::RetryConfig;
use crate::retention::RetentionPolicy;
use chrono::NaiveDateTime;
use clap::Args;
use figment::providers::{Format, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A string that never shows up in logs
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Every option of the tool, fully resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub aws_region: String,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<Secret>,

    /// Instance restored from
    pub rds_instance_id: Option<String>,
    /// Class of the restored instance; the provider keeps the source's when unset
    pub db_instance_class: Option<String>,
    pub db_availability_zone: Option<String>,
    pub db_subnet_group_name: Option<String>,
    /// Applied to the restored instance once available; empty skips the step
    pub vpc_security_groups: Vec<String>,

    pub mysql_port: u16,
    pub mysql_username: String,
    pub mysql_password: Secret,
    pub mysql_database: Option<String>,

    pub mysql_backup_host: Option<String>,
    pub mysql_backup_port: u16,
    pub mysql_backup_username: String,
    pub mysql_backup_password: Secret,
    /// Mirror databases to keep; <= 0 disables pruning
    pub mysql_backup_ttl: i64,

    pub dump_directory: PathBuf,

    pub s3_bucket: Option<String>,
    pub s3_prefix: String,
    /// Archives to keep; <= 0 disables pruning
    pub s3_save_ttl: i64,
    pub s3_endpoint_url: Option<String>,
    pub s3_force_path_style: bool,

    pub ready_timeout_secs: u64,
    pub settle_secs: u64,
    pub poll_interval_secs: u64,
    pub upload_attempts: usize,
    /// Delay before the second upload attempt; zero retries immediately
    pub upload_retry_delay_ms: u64,
    /// Cap for the doubling delay between upload attempts
    pub upload_retry_max_delay_ms: u64,
    pub upload_retry_jitter: bool,

    pub mysqldump_path: String,
    pub mysql_path: String,

    pub aws_route53_hosted_zone_id: Option<String>,
    pub aws_route53_resource_records: Vec<RecordSet>,
    pub ip_echo_url: String,

    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            aws_region: "ap-northeast-1".to_string(),
            aws_access_key_id: None,
            aws_secret_access_key: None,
            rds_instance_id: None,
            db_instance_class: None,
            db_availability_zone: None,
            db_subnet_group_name: None,
            vpc_security_groups: Vec::new(),
            mysql_port: 3306,
            mysql_username: String::new(),
            mysql_password: Secret::default(),
            mysql_database: None,
            mysql_backup_host: None,
            mysql_backup_port: 3306,
            mysql_backup_username: String::new(),
            mysql_backup_password: Secret::default(),
            mysql_backup_ttl: 0,
            dump_directory: PathBuf::from("/tmp/"),
            s3_bucket: None,
            s3_prefix: String::new(),
            s3_save_ttl: 0,
            s3_endpoint_url: None,
            s3_force_path_style: true,
            ready_timeout_secs: 7200,
            settle_secs: 120,
            poll_interval_secs: 30,
            upload_attempts: 3,
            upload_retry_delay_ms: 0,
            upload_retry_max_delay_ms: 10_000,
            upload_retry_jitter: false,
            mysqldump_path: "mysqldump".to_string(),
            mysql_path: "mysql".to_string(),
            aws_route53_hosted_zone_id: None,
            aws_route53_resource_records: Vec::new(),
            ip_echo_url: DEFAULT_IP_ECHO_URL.to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Options given on the command line. Unset options fall through to the
/// defaults file.
#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct ExplicitOptions {
    /// Region of the RDS instance
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_region: Option<String>,

    /// Access key of the AWS account
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_access_key_id: Option<String>,

    /// Secret access key of the AWS account
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_secret_access_key: Option<String>,

    /// Instance id of the source RDS instance
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rds_instance_id: Option<String>,

    /// Instance class of the restored instance
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_instance_class: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_availability_zone: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_subnet_group_name: Option<String>,

    /// Comma-separated VPC security group ids for the restored instance
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_security_groups: Option<Vec<String>>,

    /// Port of the MySQL server
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_port: Option<u16>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_username: Option<String>,

    #[arg(long, env = "RDSDUMP_MYSQL_PASSWORD", hide_env_values = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_password: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_database: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_backup_host: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_backup_port: Option<u16>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_backup_username: Option<String>,

    #[arg(long, env = "RDSDUMP_MYSQL_BACKUP_PASSWORD", hide_env_values = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_backup_password: Option<String>,

    /// Mirror databases to keep (0 keeps all)
    #[arg(long, allow_negative_numbers = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_backup_ttl: Option<i64>,

    /// Where to store the temporary sql dump file
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump_directory: Option<PathBuf>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_prefix: Option<String>,

    /// Archives to keep (0 keeps all)
    #[arg(long, allow_negative_numbers = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_save_ttl: Option<i64>,

    /// Custom S3 endpoint (LocalStack/MinIO)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_endpoint_url: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_timeout_secs: Option<u64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle_secs: Option<u64>,

    /// Delay before the second upload attempt, doubling after each failure
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_retry_delay_ms: Option<u64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_route53_hosted_zone_id: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Settings {
    /// Layers compiled defaults, the defaults file (YAML, or TOML for a
    /// `.toml` extension) and the explicit options, later layers winning.
    /// A missing file contributes nothing.
    pub fn figment<T: Serialize>(explicit: &T, defaults_file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        if let Some(path) = defaults_file {
            let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
            figment = if is_toml {
                figment.merge(Toml::file(path))
            } else {
                figment.merge(Yaml::file(path))
            };
        }

        figment.merge(Serialized::defaults(explicit))
    }

    pub fn resolve<T: Serialize>(explicit: &T, defaults_file: Option<&Path>) -> Result<Self> {
        Self::figment(explicit, defaults_file)
            .extract()
            .map_err(|e| BackupError::Config(e.to_string()))
    }

    pub fn static_keys(&self) -> Option<(String, String)> {
        match (&self.aws_access_key_id, &self.aws_secret_access_key) {
            (Some(id), Some(secret)) => Some((id.clone(), secret.expose().to_string())),
            _ => None,
        }
    }

    /// Builds the immutable context of one backup run. Fails on missing
    /// required options before anything touches a provider.
    pub fn run_context(&self, timestamp: NaiveDateTime) -> Result<RunContext> {
        let mut missing = Vec::new();
        let mut required = |name: &'static str, value: Option<&String>| -> String {
            match value.filter(|v| !v.trim().is_empty()) {
                Some(v) => v.clone(),
                None => {
                    missing.push(name);
                    String::new()
                }
            }
        };

        let source_instance_id = required("rds_instance_id", self.rds_instance_id.as_ref());
        let database = required("mysql_database", self.mysql_database.as_ref());
        let mirror_host = required("mysql_backup_host", self.mysql_backup_host.as_ref());
        let bucket = required("s3_bucket", self.s3_bucket.as_ref());
        let source_username = required("mysql_username", Some(&self.mysql_username));
        let mirror_username = required("mysql_backup_username", Some(&self.mysql_backup_username));

        if !missing.is_empty() {
            return Err(BackupError::Config(format!("missing required options: {}", missing.join(", "))));
        }
        if self.upload_attempts == 0 {
            return Err(BackupError::Config("upload_attempts must be at least 1".into()));
        }

        Ok(RunContext {
            source_instance_id,
            region: self.aws_region.clone(),
            placement: PlacementOptions {
                instance_class: self.db_instance_class.clone(),
                availability_zone: self.db_availability_zone.clone(),
                subnet_group_name: self.db_subnet_group_name.clone(),
            },
            security_groups: self.vpc_security_groups.clone(),
            database,
            source_port: self.mysql_port,
            source_username,
            source_password: self.mysql_password.clone(),
            mirror: ConnectionParams {
                host: mirror_host,
                port: self.mysql_backup_port,
                username: mirror_username,
                password: self.mysql_backup_password.expose().to_string(),
            },
            bucket,
            key_prefix: self.s3_prefix.clone(),
            mirror_retention: RetentionPolicy::new(self.mysql_backup_ttl),
            archive_retention: RetentionPolicy::new(self.s3_save_ttl),
            dump_directory: self.dump_directory.clone(),
            timestamp,
            lifecycle: LifecycleConfig {
                ready_timeout: Duration::from_secs(self.ready_timeout_secs),
                settle_interval: Duration::from_secs(self.settle_secs),
                poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            },
            upload_retry: RetryConfig::default()
                .with_max_attempts(self.upload_attempts)
                .with_initial_delay(Duration::from_millis(self.upload_retry_delay_ms))
                .with_max_delay(Duration::from_millis(self.upload_retry_max_delay_ms))
                .with_jitter(self.upload_retry_jitter),
        })
    }
}

/// Immutable configuration of a single backup run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub source_instance_id: String,
    pub region: String,
    pub placement: PlacementOptions,
    pub security_groups: Vec<String>,
    /// Logical database dumped from the restored instance
    pub database: String,
    pub source_port: u16,
    pub source_username: String,
    pub source_password: Secret,
    pub mirror: ConnectionParams,
    pub bucket: String,
    pub key_prefix: String,
    pub mirror_retention: RetentionPolicy,
    pub archive_retention: RetentionPolicy,
    pub dump_directory: PathBuf,
    pub timestamp: NaiveDateTime,
    pub lifecycle: LifecycleConfig,
    /// Attempt budget and pacing of the archive upload
    pub upload_retry: RetryConfig,
}

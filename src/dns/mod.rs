//! Record upserts for a hosted zone, with dynamic-IP (`DDNS`) records

#[cfg(feature = "aws")]
pub mod route53;

#[cfg(feature = "aws")]
pub use route53::Route53DnsProvider;

use crate::error::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Pseudo record type resolved to an `A` record for the caller's public IP
pub const DDNS_RECORD_TYPE: &str = "DDNS";

pub const DEFAULT_IP_ECHO_URL: &str = "https://ifconfig.me/ip";

pub const UPSERT_COMMENT: &str = "upsert records from cui.";

fn default_ttl() -> i64 {
    300
}

/// One record set as written in the defaults file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSet {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    #[serde(default = "default_ttl")]
    pub ttl: i64,
    #[serde(default)]
    pub resource_records: Vec<String>,
}

#[async_trait]
pub trait PublicIpResolver: Send + Sync {
    async fn public_ip(&self) -> Result<String>;
}

/// Asks a plain-text IP echo service
pub struct HttpIpResolver {
    client: reqwest::Client,
    url: String,
}

impl HttpIpResolver {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackupError::Dns(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl PublicIpResolver for HttpIpResolver {
    async fn public_ip(&self) -> Result<String> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| BackupError::Dns(format!("Public IP lookup failed: {}", e)))?
            .text()
            .await
            .map_err(|e| BackupError::Dns(format!("Public IP lookup failed: {}", e)))?;

        let ip = body.trim();
        ip.parse::<std::net::IpAddr>()
            .map_err(|_| BackupError::Dns(format!("IP echo service returned {:?}", ip)))?;
        Ok(ip.to_string())
    }
}

/// Hosted-zone record changes
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn upsert_records(&self, hosted_zone_id: &str, records: &[RecordSet], comment: &str) -> Result<()>;
}

/// Rewrites `DDNS` records into `A` records for the public IP. The IP is
/// looked up at most once, and only when a `DDNS` record is present.
pub async fn resolve_dynamic_records(
    records: Vec<RecordSet>,
    resolver: &dyn PublicIpResolver,
) -> Result<Vec<RecordSet>> {
    let mut public_ip: Option<String> = None;
    let mut resolved = Vec::with_capacity(records.len());

    for mut record in records {
        if record.record_type == DDNS_RECORD_TYPE {
            let ip = match &public_ip {
                Some(ip) => ip.clone(),
                None => {
                    let ip = resolver.public_ip().await?;
                    public_ip = Some(ip.clone());
                    ip
                }
            };
            record.record_type = "A".to_string();
            record.resource_records = vec![ip];
        }
        resolved.push(record);
    }

    Ok(resolved)
}

pub struct DnsUpserter {
    provider: Arc<dyn DnsProvider>,
    resolver: Arc<dyn PublicIpResolver>,
}

impl DnsUpserter {
    pub fn new(provider: Arc<dyn DnsProvider>, resolver: Arc<dyn PublicIpResolver>) -> Self {
        Self { provider, resolver }
    }

    pub async fn upsert(&self, hosted_zone_id: &str, records: Vec<RecordSet>) -> Result<Vec<RecordSet>> {
        if records.is_empty() {
            return Err(BackupError::Config("no aws_route53_resource_records configured".into()));
        }

        let records = resolve_dynamic_records(records, self.resolver.as_ref()).await?;
        self.provider
            .upsert_records(hosted_zone_id, &records, UPSERT_COMMENT)
            .await?;

        info!(hosted_zone_id = %hosted_zone_id, records = records.len(), "Records upserted");
        Ok(records)
    }
}

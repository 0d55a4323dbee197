// Route53 adapter for record upserts

use super::{DnsProvider, RecordSet};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use aws_sdk_route53::error::DisplayErrorContext;
use aws_sdk_route53::types::{Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType};
use aws_sdk_route53::Client;
use aws_types::SdkConfig;
use tracing::debug;

pub struct Route53DnsProvider {
    client: Client,
}

impl Route53DnsProvider {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }
}

fn build_error(e: impl std::fmt::Display) -> BackupError {
    BackupError::Dns(format!("Invalid record set: {}", e))
}

fn to_change(record: &RecordSet) -> Result<Change> {
    let values = record
        .resource_records
        .iter()
        .map(|value| ResourceRecord::builder().value(value).build().map_err(build_error))
        .collect::<Result<Vec<_>>>()?;

    let record_set = ResourceRecordSet::builder()
        .name(&record.name)
        .r#type(RrType::from(record.record_type.as_str()))
        .ttl(record.ttl)
        .set_resource_records(Some(values))
        .build()
        .map_err(build_error)?;

    Change::builder()
        .action(ChangeAction::Upsert)
        .resource_record_set(record_set)
        .build()
        .map_err(build_error)
}

#[async_trait]
impl DnsProvider for Route53DnsProvider {
    async fn upsert_records(&self, hosted_zone_id: &str, records: &[RecordSet], comment: &str) -> Result<()> {
        let changes = records.iter().map(to_change).collect::<Result<Vec<_>>>()?;
        let batch = ChangeBatch::builder()
            .comment(comment)
            .set_changes(Some(changes))
            .build()
            .map_err(build_error)?;

        let response = self
            .client
            .change_resource_record_sets()
            .hosted_zone_id(hosted_zone_id)
            .change_batch(batch)
            .send()
            .await
            .map_err(|e| {
                BackupError::Dns(format!(
                    "Failed to upsert records in {}: {}",
                    hosted_zone_id,
                    DisplayErrorContext(&e)
                ))
            })?;

        debug!(change = ?response.change_info(), "Route53 change submitted");
        Ok(())
    }
}

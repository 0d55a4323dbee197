// RDS adapter for the instance lifecycle

use super::{Endpoint, InstanceHandle, InstanceProvider, PlacementOptions};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use aws_sdk_rds::error::DisplayErrorContext;
use aws_sdk_rds::Client;
use aws_types::SdkConfig;

/// Amazon RDS implementation of [`InstanceProvider`]
pub struct RdsInstanceProvider {
    client: Client,
}

impl RdsInstanceProvider {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InstanceProvider for RdsInstanceProvider {
    async fn restore_to_latest(
        &self,
        source_id: &str,
        new_id: &str,
        placement: &PlacementOptions,
    ) -> Result<()> {
        self.client
            .restore_db_instance_to_point_in_time()
            .source_db_instance_identifier(source_id)
            .target_db_instance_identifier(new_id)
            .use_latest_restorable_time(true)
            .multi_az(false)
            .set_db_instance_class(placement.instance_class.clone())
            .set_availability_zone(placement.availability_zone.clone())
            .set_db_subnet_group_name(placement.subnet_group_name.clone())
            .send()
            .await
            .map_err(|e| BackupError::Provider(format!("Failed to restore {}: {}", source_id, DisplayErrorContext(&e))))?;

        Ok(())
    }

    async fn describe(&self, id: &str) -> Result<Option<InstanceHandle>> {
        let response = match self
            .client
            .describe_db_instances()
            .db_instance_identifier(id)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_db_instance_not_found_fault() {
                    return Ok(None);
                }
                return Err(BackupError::Provider(format!(
                    "Failed to describe {}: {}",
                    id,
                    DisplayErrorContext(&service_error)
                )));
            }
        };

        let handle = response.db_instances().first().map(|instance| InstanceHandle {
            status: instance.db_instance_status().unwrap_or_default().to_string(),
            endpoint: instance.endpoint().and_then(|endpoint| {
                endpoint.address().map(|address| Endpoint {
                    address: address.to_string(),
                    port: endpoint.port().and_then(|p| u16::try_from(p).ok()),
                })
            }),
        });

        Ok(handle)
    }

    async fn modify_security_groups(&self, id: &str, groups: &[String], apply_immediately: bool) -> Result<()> {
        self.client
            .modify_db_instance()
            .db_instance_identifier(id)
            .set_vpc_security_group_ids(Some(groups.to_vec()))
            .apply_immediately(apply_immediately)
            .send()
            .await
            .map_err(|e| BackupError::Provider(format!("Failed to modify {}: {}", id, DisplayErrorContext(&e))))?;

        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        self.client
            .delete_db_instance()
            .db_instance_identifier(id)
            .skip_final_snapshot(true)
            .send()
            .await
            .map_err(|e| BackupError::Provider(format!("Failed to delete {}: {}", id, DisplayErrorContext(&e))))?;

        Ok(())
    }
}

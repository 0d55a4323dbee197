//! Lifecycle of the transient restored database instance

#[cfg(feature = "aws")]
pub mod rds;

#[cfg(feature = "aws")]
pub use rds::RdsInstanceProvider;

use crate::error::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Provisioning state of a restored instance as tracked by this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Requested,
    Restoring,
    Available,
    Reconfigured,
    Destroying,
    Destroyed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Requested => "requested",
            InstanceState::Restoring => "restoring",
            InstanceState::Available => "available",
            InstanceState::Reconfigured => "reconfigured",
            InstanceState::Destroying => "destroying",
            InstanceState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Network address of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: Option<u16>,
}

/// Placement of the restored instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementOptions {
    pub instance_class: Option<String>,
    pub availability_zone: Option<String>,
    pub subnet_group_name: Option<String>,
}

/// Snapshot of an instance as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    /// Provider status string, e.g. `creating`, `modifying`, `available`
    pub status: String,
    pub endpoint: Option<Endpoint>,
}

impl InstanceHandle {
    pub fn is_available(&self) -> bool {
        self.status == "available"
    }
}

/// Managed-database provider operations
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Creates `new_id` from the latest restorable time of `source_id`
    async fn restore_to_latest(
        &self,
        source_id: &str,
        new_id: &str,
        placement: &PlacementOptions,
    ) -> Result<()>;

    /// `None` while the provider does not know the instance yet (or anymore)
    async fn describe(&self, id: &str) -> Result<Option<InstanceHandle>>;

    async fn modify_security_groups(&self, id: &str, groups: &[String], apply_immediately: bool) -> Result<()>;

    /// Deletes the instance without a final snapshot
    async fn destroy(&self, id: &str) -> Result<()>;
}

/// The temporary instance restored for this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredInstance {
    id: String,
    state: InstanceState,
    endpoint: Option<Endpoint>,
}

impl RestoredInstance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: InstanceState::Requested,
            endpoint: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Only readable once the instance reached `Available`
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self.state {
            InstanceState::Available | InstanceState::Reconfigured => self.endpoint.as_ref(),
            _ => None,
        }
    }
}

/// Timing bounds for lifecycle operations
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Upper bound for `await_ready`
    pub ready_timeout: Duration,
    /// Wait after a network change before the instance counts as reachable
    pub settle_interval: Duration,
    /// Delay between provider status polls
    pub poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(2 * 60 * 60),
            settle_interval: Duration::from_secs(120),
            poll_interval: Duration::from_secs(30),
        }
    }
}

pub struct InstanceLifecycleManager {
    provider: Arc<dyn InstanceProvider>,
    config: LifecycleConfig,
}

impl InstanceLifecycleManager {
    pub fn new(provider: Arc<dyn InstanceProvider>) -> Self {
        Self {
            provider,
            config: LifecycleConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Requests a restore-to-latest of `source_id` under `new_id`
    #[instrument(skip(self, placement))]
    pub async fn restore_from_latest(
        &self,
        source_id: &str,
        new_id: &str,
        placement: &PlacementOptions,
    ) -> Result<RestoredInstance> {
        let mut instance = RestoredInstance::new(new_id);
        self.provider.restore_to_latest(source_id, new_id, placement).await?;
        instance.state = InstanceState::Restoring;

        info!(source_id = %source_id, instance_id = %new_id, "Restore to latest point in time requested");
        Ok(instance)
    }

    /// Polls until the provider reports the instance available, bounded by
    /// the configured readiness timeout
    pub async fn await_ready(&self, instance: &mut RestoredInstance) -> Result<()> {
        self.await_ready_within(instance, self.config.ready_timeout).await
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    pub async fn await_ready_within(&self, instance: &mut RestoredInstance, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout);

        loop {
            match self.provider.describe(&instance.id).await? {
                Some(handle) if handle.is_available() => {
                    instance.endpoint = handle.endpoint;
                    if matches!(instance.state, InstanceState::Requested | InstanceState::Restoring) {
                        instance.state = InstanceState::Available;
                    }
                    info!(
                        waited_secs = started.elapsed().as_secs(),
                        endpoint = ?instance.endpoint.as_ref().map(|e| e.address.as_str()),
                        "Instance available"
                    );
                    return Ok(());
                }
                Some(handle) => debug!(status = %handle.status, "Instance not ready yet"),
                None => debug!("Instance not visible to provider yet"),
            }

            tokio::time::sleep(self.next_poll(&instance.id, started, deadline)?).await;
        }
    }

    /// Applies security groups immediately, then waits the settle interval
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    pub async fn reconfigure_network(&self, instance: &mut RestoredInstance, groups: &[String]) -> Result<()> {
        self.provider.modify_security_groups(&instance.id, groups, true).await?;
        info!(
            settle_secs = self.config.settle_interval.as_secs(),
            "Security groups applied, waiting for rules to propagate"
        );
        tokio::time::sleep(self.config.settle_interval).await;
        instance.state = InstanceState::Reconfigured;
        Ok(())
    }

    /// Re-awaits readiness (a modifying instance cannot be deleted), then
    /// deletes the instance. A readiness failure does not prevent the
    /// delete attempt; the first error is returned.
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    pub async fn destroy(&self, instance: &mut RestoredInstance) -> Result<()> {
        if instance.state == InstanceState::Destroyed {
            return Ok(());
        }
        instance.state = InstanceState::Destroying;

        let ready = self.await_ready_before_destroy(instance).await;
        if let Err(e) = &ready {
            warn!(error = %e, "Instance not ready before destroy, deleting anyway");
        }

        self.provider.destroy(&instance.id).await?;
        instance.state = InstanceState::Destroyed;
        instance.endpoint = None;
        info!("Instance destroyed");

        ready
    }

    /// Delay before the next status poll, or `Timeout` once the deadline
    /// passed. A timeout too large to represent never expires.
    fn next_poll(&self, id: &str, started: Instant, deadline: Option<Instant>) -> Result<Duration> {
        let now = Instant::now();
        match deadline {
            Some(deadline) if now >= deadline => Err(BackupError::Timeout {
                instance: id.to_string(),
                waited: now - started,
            }),
            Some(deadline) => Ok(self.config.poll_interval.min(deadline - now)),
            None => Ok(self.config.poll_interval),
        }
    }

    async fn await_ready_before_destroy(&self, instance: &mut RestoredInstance) -> Result<()> {
        let started = Instant::now();
        let deadline = started.checked_add(self.config.ready_timeout);
        loop {
            if let Some(handle) = self.provider.describe(&instance.id).await? {
                if handle.is_available() {
                    return Ok(());
                }
            }
            tokio::time::sleep(self.next_poll(&instance.id, started, deadline)?).await;
        }
    }
}

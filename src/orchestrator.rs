//! The backup run: restore, export, mirror, archive, prune, clean up
//!
//! A run is linear. Dump, import and compression failures end the run as
//! [`RunState::Failed`]; provider and readiness errors are returned as
//! `Err`. Either way the run passes through [`RunState::Cleanup`] exactly
//! once, which destroys the restored instance and removes local files.

use crate::archive::{ArchiveObjects, ArchiveUploader, ObjectStore, UploadOutcome, GZIP_CONTENT_TYPE};
use crate::config::RunContext;
use crate::error::{BackupError, Result};
use crate::instance::{InstanceLifecycleManager, InstanceProvider, InstanceState, RestoredInstance};
use crate::mirror::{MirrorDatabases, MirrorHost};
use crate::naming::RunNames;
use crate::pipeline::{Compressor, ConnectionParams, DatabaseTools, ExportArtifact, FileCleanup};
use crate::retention::{PruneResult, RetentionPolicy, RetentionPruner, RetentionTarget};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// States of a run. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Init,
    Restoring,
    Dumping,
    Importing,
    PruningMirror,
    Compressing,
    Uploading,
    PruningArchive,
    Cleanup,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Init => "init",
            RunState::Restoring => "restoring",
            RunState::Dumping => "dumping",
            RunState::Importing => "importing",
            RunState::PruningMirror => "pruning-mirror",
            RunState::Compressing => "compressing",
            RunState::Uploading => "uploading",
            RunState::PruningArchive => "pruning-archive",
            RunState::Cleanup => "cleanup",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What happened to one retention target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PruneReport {
    #[default]
    NotReached,
    /// Retention count <= 0
    Skipped,
    Pruned(PruneResult),
    /// Listing failed; nothing was deleted
    Failed(String),
}

/// Best-effort teardown results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub instance_destroyed: bool,
    pub destroy_error: Option<String>,
    pub files: FileCleanup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub names: RunNames,
    /// Last state reached
    pub outcome: RunState,
    /// Every state entered, in order, starting with `Init`
    pub transitions: Vec<RunState>,
    /// Why the run ended as `Failed`
    pub failure: Option<String>,
    /// `None` when the upload step was not reached
    pub upload: Option<UploadOutcome>,
    pub mirror_prune: PruneReport,
    pub archive_prune: PruneReport,
    pub cleanup: CleanupReport,
}

impl RunReport {
    fn new(names: RunNames) -> Self {
        Self {
            names,
            outcome: RunState::Init,
            transitions: vec![RunState::Init],
            failure: None,
            upload: None,
            mirror_prune: PruneReport::NotReached,
            archive_prune: PruneReport::NotReached,
            cleanup: CleanupReport::default(),
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(from = %self.outcome, to = %state, "Run state changed");
        self.outcome = state;
        self.transitions.push(state);
    }

    /// Process exit code: upload failures do not change it
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunState::Failed => 1,
            _ => 0,
        }
    }

    pub fn upload_succeeded(&self) -> bool {
        self.upload.as_ref().is_some_and(UploadOutcome::succeeded)
    }
}

/// The external systems a run drives
#[derive(Clone)]
pub struct Collaborators {
    pub instances: Arc<dyn InstanceProvider>,
    pub tools: Arc<dyn DatabaseTools>,
    pub compressor: Arc<dyn Compressor>,
    pub mirror: Arc<dyn MirrorHost>,
    pub store: Arc<dyn ObjectStore>,
}

/// How a run stopped early
enum Abort {
    /// Dump, import or compression failed: cleanup, then `Failed`
    Pipeline(BackupError),
    /// Provider or readiness error: cleanup, then `Err`
    Fatal(BackupError),
}

pub struct BackupOrchestrator {
    context: RunContext,
    names: RunNames,
    lifecycle: InstanceLifecycleManager,
    tools: Arc<dyn DatabaseTools>,
    compressor: Arc<dyn Compressor>,
    mirror: Arc<dyn MirrorHost>,
    store: Arc<dyn ObjectStore>,
    uploader: ArchiveUploader,
}

impl BackupOrchestrator {
    pub fn new(context: RunContext, collaborators: Collaborators) -> Self {
        let names = RunNames::derive(
            &context.source_instance_id,
            &context.database,
            &context.dump_directory,
            &context.key_prefix,
            context.timestamp,
        );
        let lifecycle =
            InstanceLifecycleManager::new(collaborators.instances).with_config(context.lifecycle.clone());
        let uploader = ArchiveUploader::new(collaborators.store.clone())
            .with_retry_config(context.upload_retry.clone());

        Self {
            context,
            names,
            lifecycle,
            tools: collaborators.tools,
            compressor: collaborators.compressor,
            mirror: collaborators.mirror,
            store: collaborators.store,
            uploader,
        }
    }

    pub fn names(&self) -> &RunNames {
        &self.names
    }

    pub async fn run(&self) -> Result<RunReport> {
        let mut report = RunReport::new(self.names.clone());
        let artifact = ExportArtifact::new(
            self.context.database.clone(),
            self.names.export_path.clone(),
            self.names.archive_path.clone(),
        );
        let mut instance: Option<RestoredInstance> = None;

        info!(
            source_id = %self.context.source_instance_id,
            instance_id = %self.names.instance_id,
            database = %self.context.database,
            "Starting backup run"
        );

        let result = self.execute(&mut instance, &mut report).await;

        report.enter(RunState::Cleanup);
        report.cleanup = self.cleanup(instance.as_mut(), &artifact).await;

        match result {
            Ok(()) => {
                report.enter(RunState::Done);
                info!(upload_succeeded = report.upload_succeeded(), "Backup run finished");
                Ok(report)
            }
            Err(Abort::Pipeline(e)) => {
                error!(error = %e, "Backup run failed");
                report.failure = Some(e.to_string());
                report.enter(RunState::Failed);
                Ok(report)
            }
            Err(Abort::Fatal(e)) => {
                error!(error = %e, "Backup run aborted");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        slot: &mut Option<RestoredInstance>,
        report: &mut RunReport,
    ) -> std::result::Result<(), Abort> {
        let ctx = &self.context;

        report.enter(RunState::Restoring);
        let restored = self
            .lifecycle
            .restore_from_latest(&ctx.source_instance_id, &self.names.instance_id, &ctx.placement)
            .await
            .map_err(Abort::Fatal)?;
        let instance = slot.insert(restored);

        self.lifecycle.await_ready(instance).await.map_err(Abort::Fatal)?;
        if ctx.security_groups.is_empty() {
            debug!("No security groups configured, keeping restored network settings");
        } else {
            self.lifecycle
                .reconfigure_network(instance, &ctx.security_groups)
                .await
                .map_err(Abort::Fatal)?;
        }

        let endpoint = instance.endpoint().cloned().ok_or_else(|| {
            Abort::Fatal(BackupError::Provider(format!(
                "Instance {} is available but reports no endpoint",
                instance.id()
            )))
        })?;
        let source = ConnectionParams {
            host: endpoint.address,
            port: ctx.source_port,
            username: ctx.source_username.clone(),
            password: ctx.source_password.expose().to_string(),
        };

        report.enter(RunState::Dumping);
        self.tools
            .dump(&source, &ctx.database, &self.names.export_path)
            .await
            .map_err(|e| Abort::Pipeline(e.into()))?;

        report.enter(RunState::Importing);
        self.mirror
            .recreate_database(&self.names.mirror_database)
            .await
            .map_err(Abort::Pipeline)?;
        self.tools
            .import(&ctx.mirror, &self.names.mirror_database, &self.names.export_path)
            .await
            .map_err(|e| Abort::Pipeline(e.into()))?;

        report.enter(RunState::PruningMirror);
        report.mirror_prune = match MirrorDatabases::new(self.mirror.clone(), &self.names.mirror_prefix) {
            Ok(target) => Self::prune(ctx.mirror_retention, &target).await,
            Err(e) => {
                error!(error = %e, "Cannot select mirror databases, skipping prune");
                PruneReport::Failed(e.to_string())
            }
        };

        report.enter(RunState::Compressing);
        let archive_path = self
            .compressor
            .compress_in_place(&self.names.export_path)
            .await
            .map_err(|e| Abort::Pipeline(e.into()))?;

        report.enter(RunState::Uploading);
        let upload = self
            .uploader
            .upload(&ctx.bucket, &self.names.archive_key, &archive_path, GZIP_CONTENT_TYPE, true)
            .await;
        let uploaded = upload.succeeded();
        report.upload = Some(upload);

        if uploaded {
            report.enter(RunState::PruningArchive);
            let target = ArchiveObjects::new(self.store.clone(), ctx.bucket.clone(), self.names.archive_prefix.clone());
            report.archive_prune = Self::prune(ctx.archive_retention, &target).await;
        } else {
            warn!("Upload failed, skipping archive pruning");
        }

        Ok(())
    }

    async fn prune<T: RetentionTarget>(policy: RetentionPolicy, target: &T) -> PruneReport {
        match RetentionPruner::new(policy).prune(target).await {
            Ok(result) if result.skipped => PruneReport::Skipped,
            Ok(result) => PruneReport::Pruned(result),
            Err(e) => {
                error!(retention_target = %target.target_name(), error = %e, "Pruning failed, continuing");
                PruneReport::Failed(e.to_string())
            }
        }
    }

    /// Destroys the instance (if one was requested) and removes local
    /// files. Neither step stops the other.
    async fn cleanup(&self, instance: Option<&mut RestoredInstance>, artifact: &ExportArtifact) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Some(instance) = instance {
            match self.lifecycle.destroy(instance).await {
                Ok(()) => report.instance_destroyed = true,
                Err(e) => {
                    error!(instance_id = %instance.id(), error = %e, "Failed to destroy restored instance");
                    report.instance_destroyed = instance.state() == InstanceState::Destroyed;
                    report.destroy_error = Some(e.to_string());
                }
            }
        }

        report.files = artifact.remove_files().await;
        report
    }
}

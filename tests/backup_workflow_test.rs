// End-to-end backup runs against in-memory collaborators
// The compressor is the real gzip implementation working in a scratch directory

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use rdsdump::archive::{ArchiveObject, ObjectRef, ObjectStore, UploadOutcome, UploadRequest};
use rdsdump::config::{RunContext, Settings};
use rdsdump::instance::{Endpoint, InstanceHandle, InstanceProvider, LifecycleConfig, PlacementOptions};
use rdsdump::mirror::MirrorHost;
use rdsdump::orchestrator::PruneReport;
use rdsdump::pipeline::{Compressor, ConnectionParams, DatabaseTools, GzipCompressor};
use rdsdump::{BackupError, BackupOrchestrator, Collaborators, RunState, ToolError, UploadError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Events = Arc<Mutex<Vec<String>>>;

fn log(events: &Events, event: impl Into<String>) {
    events.lock().unwrap().push(event.into());
}

struct FakeProvider {
    events: Events,
    reject_restore: bool,
    status: &'static str,
}

#[async_trait]
impl InstanceProvider for FakeProvider {
    async fn restore_to_latest(&self, source_id: &str, new_id: &str, _: &PlacementOptions) -> rdsdump::Result<()> {
        if self.reject_restore {
            return Err(BackupError::Provider(format!("DBInstanceNotFound: {}", source_id)));
        }
        log(&self.events, format!("restore {} -> {}", source_id, new_id));
        Ok(())
    }

    async fn describe(&self, _id: &str) -> rdsdump::Result<Option<InstanceHandle>> {
        Ok(Some(InstanceHandle {
            status: self.status.to_string(),
            endpoint: Some(Endpoint {
                address: "dump-prod.rds.example".to_string(),
                port: Some(3306),
            }),
        }))
    }

    async fn modify_security_groups(&self, id: &str, groups: &[String], _: bool) -> rdsdump::Result<()> {
        log(&self.events, format!("modify {} {}", id, groups.join(",")));
        Ok(())
    }

    async fn destroy(&self, id: &str) -> rdsdump::Result<()> {
        log(&self.events, format!("destroy {}", id));
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum ToolScript {
    Succeed,
    FailDump,
    FailImport,
}

struct FakeTools {
    events: Events,
    script: ToolScript,
}

#[async_trait]
impl DatabaseTools for FakeTools {
    async fn dump(&self, source: &ConnectionParams, database: &str, output: &Path) -> Result<(), ToolError> {
        log(&self.events, format!("dump {}@{}", database, source.host));
        std::fs::write(output, format!("-- dump of {}\n", database)).unwrap();
        if self.script == ToolScript::FailDump {
            return Err(ToolError::new("mysqldump", Some(2), "Access denied for user 'reader'"));
        }
        Ok(())
    }

    async fn import(&self, target: &ConnectionParams, database: &str, input: &Path) -> Result<(), ToolError> {
        assert!(input.exists(), "import reads the uncompressed export");
        log(&self.events, format!("import {}@{}", database, target.host));
        if self.script == ToolScript::FailImport {
            return Err(ToolError::new("mysql", Some(1), "ERROR 1064"));
        }
        Ok(())
    }
}

/// Fails like gzip on a full disk, leaving the export in place
struct FullDiskCompressor;

#[async_trait]
impl Compressor for FullDiskCompressor {
    async fn compress_in_place(&self, path: &Path) -> Result<PathBuf, ToolError> {
        assert!(path.exists(), "compression reads the export");
        Err(ToolError::new("gzip", None, "No space left on device"))
    }
}

struct FakeMirror {
    events: Events,
    databases: Mutex<Vec<String>>,
    fail_listing: bool,
}

#[async_trait]
impl MirrorHost for FakeMirror {
    async fn list_databases(&self) -> rdsdump::Result<Vec<String>> {
        if self.fail_listing {
            return Err(BackupError::Mirror("SHOW DATABASES: connection lost".into()));
        }
        Ok(self.databases.lock().unwrap().clone())
    }

    async fn recreate_database(&self, name: &str) -> rdsdump::Result<()> {
        log(&self.events, format!("recreate {}", name));
        let mut databases = self.databases.lock().unwrap();
        databases.retain(|d| d != name);
        databases.push(name.to_string());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> rdsdump::Result<()> {
        log(&self.events, format!("drop {}", name));
        self.databases.lock().unwrap().retain(|d| d != name);
        Ok(())
    }
}

struct FakeStore {
    events: Events,
    objects: Mutex<Vec<ArchiveObject>>,
    put_failures: usize,
    puts: Mutex<usize>,
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn list_objects(&self, _bucket: &str, prefix: &str) -> rdsdump::Result<Vec<ArchiveObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn put_object(&self, request: &UploadRequest) -> Result<ObjectRef, UploadError> {
        let mut puts = self.puts.lock().unwrap();
        *puts += 1;
        if *puts <= self.put_failures {
            return Err(UploadError::Transport("connection reset by peer".into()));
        }
        log(&self.events, format!("put {}", request.key));
        self.objects.lock().unwrap().push(ArchiveObject {
            key: request.key.clone(),
            last_modified: Utc::now(),
        });
        Ok(ObjectRef {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            etag: None,
        })
    }

    async fn delete_object(&self, object: &ObjectRef) -> rdsdump::Result<()> {
        log(&self.events, format!("delete {}", object.key));
        self.objects.lock().unwrap().retain(|o| o.key != object.key);
        Ok(())
    }
}

fn stamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .unwrap()
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, d, 0, 0, 0).unwrap()
}

fn context(dump_directory: &Path) -> RunContext {
    let settings = Settings {
        rds_instance_id: Some("prod".into()),
        mysql_database: Some("shop".into()),
        mysql_username: "reader".into(),
        mysql_backup_host: Some("mirror.internal".into()),
        mysql_backup_username: "loader".into(),
        s3_bucket: Some("archive".into()),
        s3_prefix: "backups".into(),
        mysql_backup_ttl: 3,
        s3_save_ttl: 2,
        dump_directory: dump_directory.to_path_buf(),
        ..Settings::default()
    };
    let mut ctx = settings.run_context(stamp()).unwrap();
    ctx.lifecycle = LifecycleConfig {
        ready_timeout: Duration::from_millis(50),
        settle_interval: Duration::from_millis(1),
        poll_interval: Duration::from_millis(5),
    };
    ctx
}

struct Harness {
    events: Events,
    provider: Arc<FakeProvider>,
    tools: Arc<FakeTools>,
    compressor: Arc<dyn Compressor>,
    mirror: Arc<FakeMirror>,
    store: Arc<FakeStore>,
}

impl Harness {
    fn new(script: ToolScript, put_failures: usize) -> Self {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        Self {
            provider: Arc::new(FakeProvider {
                events: events.clone(),
                reject_restore: false,
                status: "available",
            }),
            compressor: Arc::new(GzipCompressor::default()),
            tools: Arc::new(FakeTools {
                events: events.clone(),
                script,
            }),
            mirror: Arc::new(FakeMirror {
                events: events.clone(),
                databases: Mutex::new(vec![
                    "information_schema".to_string(),
                    "dump_shop_20240104000000".to_string(),
                    "dump_shop_20240101000000".to_string(),
                    "dump_shop_20240103000000".to_string(),
                    "dump_shop_20240102000000".to_string(),
                    "dump_shop_manual".to_string(),
                    "dump_shopfront_20240101000000".to_string(),
                ]),
                fail_listing: false,
            }),
            store: Arc::new(FakeStore {
                events: events.clone(),
                objects: Mutex::new(vec![
                    ArchiveObject {
                        key: "backups/prod-mysqldump-20240403000000.sql.gz".into(),
                        last_modified: day(3),
                    },
                    ArchiveObject {
                        key: "backups/prod-mysqldump-20240401000000.sql.gz".into(),
                        last_modified: day(1),
                    },
                    ArchiveObject {
                        key: "backups/prod-mysqldump-20240402000000.sql.gz".into(),
                        last_modified: day(2),
                    },
                    ArchiveObject {
                        key: "backups/staging-mysqldump-20240101000000.sql.gz".into(),
                        last_modified: day(1),
                    },
                ]),
                put_failures,
                puts: Mutex::new(0),
            }),
            events,
        }
    }

    fn orchestrator(&self, ctx: RunContext) -> BackupOrchestrator {
        BackupOrchestrator::new(
            ctx,
            Collaborators {
                instances: self.provider.clone(),
                tools: self.tools.clone(),
                compressor: self.compressor.clone(),
                mirror: self.mirror.clone(),
                store: self.store.clone(),
            },
        )
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[tokio::test]
async fn test_successful_run_prunes_both_targets() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ToolScript::Succeed, 0);
    let orchestrator = harness.orchestrator(context(dir.path()));
    let names = orchestrator.names().clone();

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        report.transitions,
        vec![
            RunState::Init,
            RunState::Restoring,
            RunState::Dumping,
            RunState::Importing,
            RunState::PruningMirror,
            RunState::Compressing,
            RunState::Uploading,
            RunState::PruningArchive,
            RunState::Cleanup,
            RunState::Done,
        ]
    );
    assert_eq!(
        harness.events(),
        vec![
            "restore prod -> dump-prod-20240501120000",
            "dump shop@dump-prod.rds.example",
            "recreate dump_shop_20240501120000",
            "import dump_shop_20240501120000@mirror.internal",
            "drop dump_shop_20240101000000",
            "drop dump_shop_20240102000000",
            "put backups/prod-mysqldump-20240501120000.sql.gz",
            "delete backups/prod-mysqldump-20240401000000.sql.gz",
            "delete backups/prod-mysqldump-20240402000000.sql.gz",
            "destroy dump-prod-20240501120000",
        ]
    );

    assert!(matches!(report.upload, Some(UploadOutcome::Uploaded { attempts: 1, .. })));
    match &report.mirror_prune {
        PruneReport::Pruned(result) => assert_eq!(result.retained, 3),
        other => panic!("unexpected mirror prune report: {:?}", other),
    }
    assert!(harness
        .mirror
        .databases
        .lock()
        .unwrap()
        .contains(&"dump_shop_manual".to_string()));
    assert!(harness
        .store
        .objects
        .lock()
        .unwrap()
        .iter()
        .any(|o| o.key.starts_with("backups/staging-")));

    assert!(report.cleanup.instance_destroyed);
    assert_eq!(report.cleanup.files.removed, vec![names.archive_path.clone()]);
    assert!(!names.export_path.exists());
    assert!(!names.archive_path.exists());
}

#[tokio::test]
async fn test_dump_failure_skips_pipeline_and_still_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ToolScript::FailDump, 0);
    let orchestrator = harness.orchestrator(context(dir.path()));
    let names = orchestrator.names().clone();

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.outcome, RunState::Failed);
    assert_eq!(
        report.transitions,
        vec![
            RunState::Init,
            RunState::Restoring,
            RunState::Dumping,
            RunState::Cleanup,
            RunState::Failed,
        ]
    );
    assert!(report.failure.as_deref().unwrap_or_default().contains("mysqldump"));

    assert_eq!(harness.count("import"), 0);
    assert_eq!(harness.count("recreate"), 0);
    assert_eq!(harness.count("drop"), 0);
    assert_eq!(*harness.store.puts.lock().unwrap(), 0);
    assert_eq!(report.upload, None);
    assert_eq!(report.mirror_prune, PruneReport::NotReached);
    assert_eq!(report.archive_prune, PruneReport::NotReached);

    assert_eq!(harness.count("destroy"), 1);
    assert_eq!(report.cleanup.files.removed, vec![names.export_path.clone()]);
    assert!(!names.export_path.exists());
}

#[tokio::test]
async fn test_upload_failure_skips_archive_pruning_with_exit_zero() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ToolScript::Succeed, usize::MAX);

    let report = harness.orchestrator(context(dir.path())).run().await.unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.outcome, RunState::Done);
    assert!(matches!(
        report.upload,
        Some(UploadOutcome::Failed {
            error: UploadError::Transport(_),
            attempts: 3
        })
    ));
    assert_eq!(*harness.store.puts.lock().unwrap(), 3);
    assert_eq!(report.archive_prune, PruneReport::NotReached);
    assert_eq!(harness.count("delete"), 0);
    assert!(!report.transitions.contains(&RunState::PruningArchive));
    assert_eq!(harness.count("destroy"), 1);
}

#[tokio::test]
async fn test_upload_recovers_within_attempt_budget() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ToolScript::Succeed, 2);

    let report = harness.orchestrator(context(dir.path())).run().await.unwrap();

    assert!(matches!(report.upload, Some(UploadOutcome::Uploaded { attempts: 3, .. })));
    assert!(matches!(report.archive_prune, PruneReport::Pruned(_)));
}

#[tokio::test]
async fn test_upload_retries_wait_between_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ToolScript::Succeed, 2);
    let mut ctx = context(dir.path());
    ctx.upload_retry = ctx
        .upload_retry
        .with_initial_delay(Duration::from_millis(20))
        .with_jitter(true);
    let started = std::time::Instant::now();

    let report = harness.orchestrator(ctx).run().await.unwrap();

    // 20ms then 40ms between the three puts
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert!(matches!(report.upload, Some(UploadOutcome::Uploaded { attempts: 3, .. })));
    assert_eq!(*harness.store.puts.lock().unwrap(), 3);
}

#[tokio::test]
async fn test_compression_failure_is_failed_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(ToolScript::Succeed, 0);
    harness.compressor = Arc::new(FullDiskCompressor);
    let orchestrator = harness.orchestrator(context(dir.path()));
    let names = orchestrator.names().clone();

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        report.transitions,
        vec![
            RunState::Init,
            RunState::Restoring,
            RunState::Dumping,
            RunState::Importing,
            RunState::PruningMirror,
            RunState::Compressing,
            RunState::Cleanup,
            RunState::Failed,
        ]
    );
    assert!(report.failure.as_deref().unwrap_or_default().contains("No space left on device"));

    assert_eq!(report.upload, None);
    assert_eq!(*harness.store.puts.lock().unwrap(), 0);
    assert_eq!(report.archive_prune, PruneReport::NotReached);
    assert_eq!(harness.count("delete"), 0);
    assert!(matches!(report.mirror_prune, PruneReport::Pruned(_)));

    assert_eq!(harness.count("destroy"), 1);
    assert!(report.cleanup.instance_destroyed);
    assert_eq!(report.cleanup.files.removed, vec![names.export_path.clone()]);
    assert!(!names.export_path.exists());
}

#[tokio::test]
async fn test_import_failure_is_failed_run() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ToolScript::FailImport, 0);

    let report = harness.orchestrator(context(dir.path())).run().await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(harness.count("recreate"), 1);
    assert_eq!(harness.count("drop"), 0);
    assert_eq!(report.upload, None);
    assert_eq!(harness.count("destroy"), 1);
}

#[tokio::test]
async fn test_rejected_restore_returns_provider_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(ToolScript::Succeed, 0);
    harness.provider = Arc::new(FakeProvider {
        events: harness.events.clone(),
        reject_restore: true,
        status: "available",
    });

    let err = harness.orchestrator(context(dir.path())).run().await.unwrap_err();

    assert!(matches!(err, BackupError::Provider(_)));
    assert_eq!(harness.count("dump"), 0);
    assert_eq!(harness.count("destroy"), 0);
}

#[tokio::test]
async fn test_readiness_timeout_still_destroys_instance() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(ToolScript::Succeed, 0);
    harness.provider = Arc::new(FakeProvider {
        events: harness.events.clone(),
        reject_restore: false,
        status: "creating",
    });

    let err = harness.orchestrator(context(dir.path())).run().await.unwrap_err();

    assert!(matches!(err, BackupError::Timeout { .. }));
    assert_eq!(harness.count("dump"), 0);
    assert_eq!(harness.count("destroy"), 1);
}

#[tokio::test]
async fn test_security_groups_applied_before_dump() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ToolScript::Succeed, 0);
    let mut ctx = context(dir.path());
    ctx.security_groups = vec!["sg-0a1".to_string(), "sg-0b2".to_string()];

    harness.orchestrator(ctx).run().await.unwrap();

    let events = harness.events();
    assert_eq!(events[1], "modify dump-prod-20240501120000 sg-0a1,sg-0b2");
    assert!(events[2].starts_with("dump "));
}

#[tokio::test]
async fn test_mirror_listing_failure_does_not_fail_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(ToolScript::Succeed, 0);
    harness.mirror = Arc::new(FakeMirror {
        events: harness.events.clone(),
        databases: Mutex::new(Vec::new()),
        fail_listing: true,
    });

    let report = harness.orchestrator(context(dir.path())).run().await.unwrap();

    assert_eq!(report.exit_code(), 0);
    assert!(matches!(report.mirror_prune, PruneReport::Failed(_)));
    assert!(report.upload_succeeded());
}

#[tokio::test]
async fn test_disabled_retention_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(ToolScript::Succeed, 0);
    let mut ctx = context(dir.path());
    ctx.mirror_retention = rdsdump::retention::RetentionPolicy::new(0);
    ctx.archive_retention = rdsdump::retention::RetentionPolicy::new(-1);

    let report = harness.orchestrator(ctx).run().await.unwrap();

    assert_eq!(report.mirror_prune, PruneReport::Skipped);
    assert_eq!(report.archive_prune, PruneReport::Skipped);
    assert_eq!(harness.count("drop"), 0);
    assert_eq!(harness.count("delete"), 0);
}

use anyhow::Context;
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use rdsdump::archive::{S3ObjectStore, S3Options};
use rdsdump::aws::{load_sdk_config, StaticKeys};
use rdsdump::config::{ExplicitOptions, Settings};
use rdsdump::dns::{DnsUpserter, HttpIpResolver, Route53DnsProvider};
use rdsdump::instance::RdsInstanceProvider;
use rdsdump::mirror::MySqlMirrorHost;
use rdsdump::pipeline::{GzipCompressor, MysqlTools};
use rdsdump::{BackupOrchestrator, Collaborators};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rdsdump", version, about = "Point-in-time backups of RDS MySQL instances")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a mysqldump from a restored snapshot of the specified RDS instance
    Mysql(RunArgs),
    /// Route53 record management
    #[command(subcommand)]
    Dns(DnsCommand),
}

#[derive(Subcommand)]
enum DnsCommand {
    /// Upserts the configured record sets, resolving DDNS records to this host's public IP
    Upsert(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// YAML (or .toml) file of defaults for any option. Options given on the command line override these.
    #[arg(long)]
    file: Option<PathBuf>,

    #[command(flatten)]
    options: ExplicitOptions,
}

impl RunArgs {
    fn settings(&self) -> anyhow::Result<Settings> {
        Settings::resolve(&self.options, self.file.as_deref()).context("failed to resolve configuration")
    }
}

fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();
}

fn static_keys(settings: &Settings) -> Option<StaticKeys> {
    settings
        .static_keys()
        .map(|(access_key_id, secret_access_key)| StaticKeys {
            access_key_id,
            secret_access_key,
        })
}

async fn backup(args: RunArgs) -> anyhow::Result<i32> {
    let settings = args.settings()?;
    init_tracing(&settings.log_level);

    let context = settings.run_context(Local::now().naive_local())?;
    let sdk_config = load_sdk_config(&context.region, static_keys(&settings)).await;

    let mirror = Arc::new(MySqlMirrorHost::connect_lazy(&context.mirror));
    let collaborators = Collaborators {
        instances: Arc::new(RdsInstanceProvider::new(&sdk_config)),
        tools: Arc::new(MysqlTools::new(&settings.mysqldump_path, &settings.mysql_path)),
        compressor: Arc::new(GzipCompressor::default()),
        mirror: mirror.clone(),
        store: Arc::new(S3ObjectStore::new(
            &sdk_config,
            &S3Options {
                endpoint_url: settings.s3_endpoint_url.clone(),
                force_path_style: settings.s3_force_path_style,
            },
        )),
    };

    let result = BackupOrchestrator::new(context, collaborators).run().await;
    mirror.close().await;
    let report = result?;

    if report.upload.is_some() && !report.upload_succeeded() {
        warn!(key = %report.names.archive_key, "S3 upload failed");
    }
    info!(
        outcome = %report.outcome,
        instance_destroyed = report.cleanup.instance_destroyed,
        files_removed = report.cleanup.files.removed.len(),
        "Run complete"
    );

    Ok(report.exit_code())
}

async fn upsert_records(args: RunArgs) -> anyhow::Result<()> {
    let settings = args.settings()?;
    init_tracing(&settings.log_level);

    let zone = settings
        .aws_route53_hosted_zone_id
        .clone()
        .context("aws_route53_hosted_zone_id is required")?;
    let sdk_config = load_sdk_config(&settings.aws_region, static_keys(&settings)).await;

    let upserter = DnsUpserter::new(
        Arc::new(Route53DnsProvider::new(&sdk_config)),
        Arc::new(HttpIpResolver::new(settings.ip_echo_url.clone())?),
    );
    let applied = upserter
        .upsert(&zone, settings.aws_route53_resource_records.clone())
        .await?;

    for record in &applied {
        info!(name = %record.name, record_type = %record.record_type, values = ?record.resource_records, "Upserted");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Mysql(args) => backup(args).await?,
        Command::Dns(DnsCommand::Upsert(args)) => {
            upsert_records(args).await?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

//! # rdsdump
//!
//! Point-in-time backups of a managed MySQL instance.
//!
//! A run restores a temporary instance from the latest restorable time of a
//! source instance, dumps one database from it, imports the dump into a
//! timestamped database on a mirror host, archives the gzipped dump to
//! object storage and prunes old mirror databases and archives. The
//! temporary instance and local files are always cleaned up.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rdsdump::config::{ExplicitOptions, Settings};
//! use rdsdump::naming::RunNames;
//! use std::path::Path;
//!
//! # fn example() -> rdsdump::Result<()> {
//! let settings = Settings::resolve(&ExplicitOptions::default(), Some(Path::new("defaults.yml")))?;
//! let ctx = settings.run_context(chrono::Local::now().naive_local())?;
//!
//! let names = RunNames::derive(
//!     &ctx.source_instance_id,
//!     &ctx.database,
//!     &ctx.dump_directory,
//!     &ctx.key_prefix,
//!     ctx.timestamp,
//! );
//! println!("restoring into {}", names.instance_id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`]: the run state machine
//! - [`instance`]: restored instance lifecycle
//! - [`pipeline`]: dump, import and compression
//! - [`mirror`]: databases on the mirror host
//! - [`archive`]: uploads and archive objects
//! - [`retention`]: keep-newest-N pruning
//! - [`config`]: option resolution
//! - [`dns`]: hosted-zone record upserts

pub mod archive;
pub mod config;
pub mod dns;
pub mod error;
pub mod instance;
pub mod mirror;
pub mod naming;
pub mod orchestrator;
pub mod pipeline;
pub mod resilience;
pub mod retention;

#[cfg(feature = "aws")]
pub mod aws;

pub use error::{BackupError, Result, ToolError, UploadError};
pub use orchestrator::{BackupOrchestrator, Collaborators, RunReport, RunState};

//! Staged live-ISO build pipeline.
//!
//! Turns a Debian release plus operator-supplied package lists, identity,
//! branding and service units into a bootable, checksummed live ISO:
//!
//! - **Stages** - bootstrap, mount, install, customize, assemble; a strictly
//!   linear [`StagePlan`] over the [`BuildState`] machine
//! - **Resource safety** - every mount, scratch directory and background
//!   process is registered with a [`ResourceTracker`] and released LIFO on
//!   every exit path
//! - **Privileged executor** - all external commands go through the
//!   [`Executor`] trait, so tests drive the whole pipeline with a fake
//! - **Artifacts** - squashfs, GRUB config, ISO, SHA-256/MD5, package manifest
//!
//! # Architecture
//!
//! ```text
//! forge-builder (bin)
//!     │
//!     └── pipeline::run_pipeline
//!             ├── preflight            read-only host/input checks
//!             ├── build::StageRunner   stages in order, ReleaseGuard
//!             │       └── stages::*    use BuildContext -> Executor, ResourceTracker
//!             ├── verify               optional QEMU smoke boot
//!             └── run_record           <output>/run-manifest.json
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use forge_builder::{run_pipeline, BuildConfig, BuildOptions, CancelToken, HostExecutor};
//!
//! let cancel = CancelToken::new();
//! let config = BuildConfig::load("forge.toml".as_ref())?;
//! let report = run_pipeline(
//!     config,
//!     &BuildOptions::default(),
//!     Box::new(HostExecutor::new(cancel.clone())),
//!     cancel,
//! );
//! println!("{}", report.status_line());
//! std::process::exit(report.exit_code);
//! ```

pub mod artifact;
pub mod build;
pub mod config;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod resources;
pub mod run_record;
pub mod stages;
pub mod verify;

#[cfg(test)]
mod testing;

pub use artifact::BuildArtifact;
pub use build::context::BuildContext;
pub use build::runner::StageRunner;
pub use build::stage::{BuildState, Stage, StagePlan, StageResult};
pub use config::BuildConfig;
pub use error::{ExecError, FailureClass, PreconditionError};
pub use executor::{Executor, HostExecutor, Operation};
pub use interrupt::CancelToken;
pub use pipeline::{run_pipeline, BuildOptions, PipelineReport};
pub use resources::{ResourceTracker, TrackedResource};

//! Privileged executor - runs one external operation at a time.
//!
//! Stages never spawn processes directly. They describe what to run as an
//! [`Operation`] and hand it to an [`Executor`], which makes the whole
//! pipeline drivable by a recording fake in tests and keeps one place where
//! every invocation is logged.
//!
//! # Usage
//!
//! ```rust,ignore
//! use forge_builder::executor::{Executor, HostExecutor, Operation};
//!
//! let exec = HostExecutor::new(cancel);
//! exec.run(&Operation::new("mount").args(["-t", "proc", "proc"]).arg_path(&proc_dir))?;
//! exec.run(&Operation::in_chroot(root, "apt-get").args(["install", "-y", "curl"]))?;
//! ```

pub mod chroot;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::error::ExecError;
use crate::interrupt::CancelToken;
use crate::process::{Cmd, CommandResult};

pub use chroot::{ensure_within_root, resolve_in_root};

/// Environment every chroot-scoped command runs with.
pub const CHROOT_ENV: &[(&str, &str)] = &[
    ("DEBIAN_FRONTEND", "noninteractive"),
    ("LC_ALL", "C"),
    ("LANG", "C"),
];

/// One external operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Run with the filesystem root redirected to this directory.
    pub chroot: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Stage work stops on operator interrupt; release work must not.
    pub cancellable: bool,
}

impl Operation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            chroot: None,
            timeout: None,
            cancellable: true,
        }
    }

    /// An operation executed inside `root` via `chroot`.
    pub fn in_chroot(root: &Path, program: impl Into<String>) -> Self {
        let mut op = Self::new(program);
        op.chroot = Some(root.to_path_buf());
        op.env = CHROOT_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        op
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run to completion even after an interrupt. Used by resource release.
    pub fn uncancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    /// Human-readable command line, used in logs and diagnostics.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(root) = &self.chroot {
            parts.push(format!("chroot {}", root.display()));
        }
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Captured result of a successful operation.
pub type Output = CommandResult;

/// Runs external operations on behalf of stages.
pub trait Executor {
    /// Run one operation. A non-zero exit is an error carrying the output.
    fn run(&self, op: &Operation) -> Result<Output, ExecError>;

    /// Locate a host tool without running it. Never mutates anything.
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Executor that runs operations on the host.
#[derive(Debug, Clone, Default)]
pub struct HostExecutor {
    cancel: CancelToken,
}

impl HostExecutor {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

impl Executor for HostExecutor {
    fn run(&self, op: &Operation) -> Result<Output, ExecError> {
        info!(
            program = %op.program,
            args = ?op.args,
            chroot = ?op.chroot,
            "exec"
        );

        let mut cmd = match &op.chroot {
            Some(root) => Cmd::new("chroot").arg_path(root).arg(&op.program),
            None => Cmd::new(op.program.clone()),
        };
        cmd = cmd.args(&op.args).timeout(op.timeout);
        if op.cancellable {
            cmd = cmd.cancel(self.cancel.clone());
        }
        for (key, value) in &op.env {
            cmd = cmd.env(key.clone(), value.clone());
        }

        // Failures inside the root are reported against the chrooted tool,
        // not against `chroot` itself.
        cmd.run().map_err(|err| match err {
            ExecError::NonZeroExit { code, output, .. } => ExecError::NonZeroExit {
                program: op.program.clone(),
                code,
                output,
            },
            other => other,
        })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

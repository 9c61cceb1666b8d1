//! Typed errors for the build pipeline.
//!
//! Most of the crate propagates `anyhow::Error`. The two types here are the
//! ones callers need to match on: [`ExecError`] for external tool failures
//! and [`PreconditionError`] for bad input state detected before anything
//! is mutated. [`FailureClass::of`] walks an `anyhow` chain to decide which
//! exit code a failure maps to.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single external operation.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The external tool is not installed. Fatal, never retried.
    #[error("required tool '{program}' not found in PATH")]
    NotFound { program: String },

    /// The tool exists but could not be started.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited unsuccessfully.
    #[error("'{program}' exited with status {}:\n{output}", display_code(.code))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        output: String,
    },

    /// The tool exceeded its configured deadline and was killed.
    #[error("'{program}' timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    /// The run was cancelled while the tool was running.
    #[error("'{program}' interrupted by operator")]
    Interrupted { program: String },
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl ExecError {
    /// Captured stdout/stderr, when the tool got far enough to produce any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::NonZeroExit { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Bad input state, reported before any resource is acquired.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error(
        "target root '{}' is not empty; wipe it or pass --reuse-target",
        .0.display()
    )]
    TargetNotEmpty(PathBuf),

    #[error("missing required host tools:\n{}", format_missing(.0))]
    MissingTools(Vec<(String, String)>),

    #[error("building an image requires root privileges (effective uid {0})")]
    NotRoot(u32),

    #[error("path '{path}' escapes target root '{}'", .root.display())]
    PathEscapesRoot { root: PathBuf, path: String },

    #[error("input {what} not found: {}", .path.display())]
    MissingInput { what: &'static str, path: PathBuf },

    #[error("cannot skip through stage {requested}: the plan has {stages} stages")]
    InvalidResume { requested: usize, stages: usize },
}

fn format_missing(missing: &[(String, String)]) -> String {
    missing
        .iter()
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect::<Vec<_>>()
        .join("\n")
}

/// How a failed run is reported to automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retrying without fixing the environment is pointless. Exit code 2.
    Precondition,
    /// A stage failed while executing. Exit code 1.
    Stage,
}

impl FailureClass {
    pub fn of(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if cause.downcast_ref::<PreconditionError>().is_some() {
                return FailureClass::Precondition;
            }
            if let Some(ExecError::NotFound { .. }) = cause.downcast_ref::<ExecError>() {
                return FailureClass::Precondition;
            }
        }
        FailureClass::Stage
    }

    pub fn exit_code(self) -> i32 {
        match self {
            FailureClass::Precondition => 2,
            FailureClass::Stage => 1,
        }
    }
}

/// First captured tool output found in an error chain.
pub fn captured_output(err: &anyhow::Error) -> Option<&str> {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ExecError>())
        .find_map(ExecError::output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_not_found_is_precondition() {
        let err = anyhow::Error::new(ExecError::NotFound {
            program: "debootstrap".into(),
        })
        .context("bootstrapping");
        assert_eq!(FailureClass::of(&err), FailureClass::Precondition);
        assert_eq!(FailureClass::of(&err).exit_code(), 2);
    }

    #[test]
    fn test_nonzero_exit_is_stage_failure() {
        let result: Result<(), ExecError> = Err(ExecError::NonZeroExit {
            program: "apt-get".into(),
            code: Some(100),
            output: "E: Unable to locate package nope".into(),
        });
        let err = result.context("installing packages").unwrap_err();
        assert_eq!(FailureClass::of(&err), FailureClass::Stage);
        assert_eq!(
            captured_output(&err),
            Some("E: Unable to locate package nope")
        );
    }

    #[test]
    fn test_sub_second_timeout_is_reported_precisely() {
        let err = ExecError::Timeout {
            program: "mksquashfs".into(),
            after: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "'mksquashfs' timed out after 200ms");
    }

    #[test]
    fn test_missing_tools_message_names_packages() {
        let err = PreconditionError::MissingTools(vec![(
            "mksquashfs".into(),
            "squashfs-tools".into(),
        )]);
        assert!(err.to_string().contains("mksquashfs (install: squashfs-tools)"));
    }
}

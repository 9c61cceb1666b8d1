//! What a finished run tells its caller.

use std::fmt::Write as _;
use std::path::PathBuf;

use crate::artifact::BuildArtifact;
use crate::build::stage::BuildState;
use crate::preflight::PreflightReport;

/// Lines of captured tool output repeated in the status summary.
const OUTPUT_TAIL_LINES: usize = 15;

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// 0 success, 1 stage failure, 2 precondition violation.
    pub exit_code: i32,
    pub dry_run: bool,
    pub interrupted: bool,
    pub furthest: BuildState,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed_stage: Option<String>,
    /// Full error chain of the primary failure.
    pub reason: Option<String>,
    /// Output of the first failing external operation.
    pub captured_output: Option<String>,
    pub resources_acquired: usize,
    /// Distinct from the primary failure: these never change the exit code.
    pub release_failures: Vec<String>,
    pub preflight: Option<PreflightReport>,
    pub artifact: Option<BuildArtifact>,
    pub run_record: Option<PathBuf>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Human summary: outcome, furthest state, and the first failure's
    /// captured output.
    pub fn status_line(&self) -> String {
        let mut out = String::new();

        if self.is_success() {
            if self.dry_run {
                let (tools, packages) = self
                    .preflight
                    .as_ref()
                    .map_or((0, 0), |p| (p.tools.len(), p.package_count()));
                let _ = write!(
                    out,
                    "DRY RUN OK: preflight passed ({} tools found, {} packages listed); nothing was changed",
                    tools, packages
                );
            } else {
                let _ = write!(out, "SUCCESS: reached '{}'", self.furthest);
                if let Some(artifact) = &self.artifact {
                    let _ = write!(
                        out,
                        "\n  image:  {} ({} bytes)\n  sha256: {}",
                        artifact.image_path.display(),
                        artifact.size_bytes,
                        artifact.checksums.sha256
                    );
                }
            }
        } else {
            let label = if self.exit_code == 2 {
                "PRECONDITION FAILED"
            } else if self.interrupted {
                "INTERRUPTED"
            } else {
                "FAILED"
            };
            let _ = write!(out, "{}", label);
            if let Some(stage) = &self.failed_stage {
                let _ = write!(out, " at stage '{}'", stage);
            }
            let _ = write!(out, " (furthest state: {})", self.furthest);
            if let Some(reason) = &self.reason {
                let _ = write!(out, "\n  reason: {}", reason);
            }
            if let Some(output) = &self.captured_output {
                let lines: Vec<&str> = output.lines().collect();
                let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
                let _ = write!(out, "\n  output:");
                for line in &lines[start..] {
                    let _ = write!(out, "\n    {}", line);
                }
            }
        }

        if !self.release_failures.is_empty() {
            let _ = write!(
                out,
                "\n  WARNING: {} resource(s) could not be released; manual cleanup may be required:",
                self.release_failures.len()
            );
            for failure in &self.release_failures {
                let _ = write!(out, "\n    {}", failure);
            }
        }
        out
    }
}

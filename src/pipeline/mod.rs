//! Pipeline orchestrator - the entry point for one build.
//!
//! ```text
//! preflight ──> (dry run? stop) ──> StageRunner(plan) ──> release ──> [verify] ──> run record
//! ```
//!
//! The orchestrator owns the [`BuildContext`] for the whole run and turns
//! the outcome into a [`PipelineReport`] whose exit code follows the
//! failure taxonomy: 0 success, 1 stage failure, 2 precondition violation.

pub mod report;

pub use report::PipelineReport;

use std::time::Duration;

use tracing::{error, info, warn};

use crate::build::context::BuildContext;
use crate::build::runner::StageRunner;
use crate::build::stage::{BuildState, StageResult};
use crate::config::BuildConfig;
use crate::error::{captured_output, FailureClass, PreconditionError};
use crate::executor::Executor;
use crate::interrupt::CancelToken;
use crate::preflight::run_preflight;
use crate::run_record::{RunRecord, RunStatus};
use crate::stages::standard_plan;
use crate::verify::verify_boot;

/// Name reported when the post-build boot check fails.
pub const VERIFY_STAGE: &str = "verify";

/// Per-invocation switches that are not part of the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Run preflight only; acquire nothing and run nothing.
    pub dry_run: bool,
    /// Skip stages with ordinal `<= skip_through` (resume).
    pub skip_through: usize,
    /// Boot the finished ISO in QEMU.
    pub verify_boot: bool,
    pub verify_timeout: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            skip_through: 0,
            verify_boot: false,
            verify_timeout: Duration::from_secs(300),
        }
    }
}

/// Run the whole pipeline and report how it ended.
pub fn run_pipeline(
    config: BuildConfig,
    options: &BuildOptions,
    executor: Box<dyn Executor>,
    cancel: CancelToken,
) -> PipelineReport {
    let mut report = PipelineReport {
        dry_run: options.dry_run,
        ..Default::default()
    };

    let plan = match standard_plan() {
        Ok(plan) => plan,
        Err(err) => return fail_before_run(report, err),
    };
    if options.skip_through > plan.len() {
        let err = PreconditionError::InvalidResume {
            requested: options.skip_through,
            stages: plan.len(),
        };
        return fail_before_run(report, err.into());
    }

    match run_preflight(&config, options, executor.as_ref()) {
        Ok(preflight) => report.preflight = Some(preflight),
        Err(err) => return fail_before_run(report, err),
    }
    if options.dry_run {
        info!("dry run: preflight passed, stopping before any stage");
        return report;
    }

    let mut record = match RunRecord::start() {
        Ok(record) => record,
        Err(err) => return fail_before_run(report, err),
    };
    info!(run_id = %record.run_id, stages = plan.len(), skip_through = options.skip_through, "run started");

    let output_dir = config.build.output_dir.clone();
    let mut ctx = BuildContext::new(config, executor, cancel.clone());
    let outcome = StageRunner::new()
        .skip_through(options.skip_through)
        .run(&plan, &mut ctx);

    report.furthest = outcome.furthest;
    report.completed = ctx.completed().to_vec();
    report.skipped = outcome.skipped;
    report.resources_acquired = ctx.tracker.acquired_total();
    report.release_failures = outcome
        .release
        .failures
        .iter()
        .map(ToString::to_string)
        .collect();
    report.artifact = ctx.artifact().cloned();

    match outcome.result {
        StageResult::Success => {
            report.exit_code = 0;
            if options.verify_boot {
                run_verification(&mut report, &ctx, options, &cancel);
            }
        }
        StageResult::Failure { stage, reason } => {
            record_failure(&mut report, Some(stage), &reason);
        }
    }
    report.interrupted = !report.is_success() && cancel.is_cancelled();

    finish_record(&mut record, &report);
    match record.write(&output_dir) {
        Ok(path) => report.run_record = Some(path),
        Err(err) => warn!(error = %format!("{:#}", err), "could not write run record"),
    }
    report
}

fn run_verification(
    report: &mut PipelineReport,
    ctx: &BuildContext,
    options: &BuildOptions,
    cancel: &CancelToken,
) {
    let Some(artifact) = ctx.artifact() else {
        return;
    };
    if let Err(err) = verify_boot(
        ctx.executor(),
        &artifact.image_path,
        options.verify_timeout,
        cancel,
    ) {
        // The artifact stays on disk; only the verdict changes.
        record_failure(report, Some(VERIFY_STAGE.to_string()), &err);
    }
}

fn record_failure(report: &mut PipelineReport, stage: Option<String>, reason: &anyhow::Error) {
    let class = FailureClass::of(reason);
    report.exit_code = class.exit_code();
    report.failed_stage = stage;
    report.reason = Some(format!("{:#}", reason));
    report.captured_output = captured_output(reason).map(str::to_string);
    error!(
        stage = report.failed_stage.as_deref().unwrap_or("-"),
        exit_code = report.exit_code,
        "run failed"
    );
}

fn fail_before_run(mut report: PipelineReport, err: anyhow::Error) -> PipelineReport {
    record_failure(&mut report, None, &err);
    report.furthest = BuildState::Uninitialized;
    report
}

fn finish_record(record: &mut RunRecord, report: &PipelineReport) {
    record.status = if report.is_success() {
        RunStatus::Success
    } else if report.interrupted {
        RunStatus::Interrupted
    } else {
        RunStatus::Failed
    };
    record.exit_code = report.exit_code;
    record.furthest_state = report.furthest.to_string();
    record.completed_stages = report.completed.clone();
    record.skipped_stages = report.skipped.clone();
    record.failed_stage = report.failed_stage.clone();
    record.reason = report.reason.clone();
    record.release_failures = report.release_failures.clone();
    record.artifact = report.artifact.clone();
    if let Err(err) = record.finish() {
        warn!(error = %err, "could not timestamp run record");
    }
}

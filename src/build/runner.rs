//! Stage runner - sequential execution with guaranteed release.
//!
//! The runner holds the context through a [`ReleaseGuard`] for the whole
//! loop. Normal completion, the first failing stage, an operator interrupt
//! and a panic inside a stage all leave through the guard, so
//! `release_all` runs exactly once per run.

use anyhow::anyhow;
use tracing::{error, info, warn};

use crate::build::context::BuildContext;
use crate::build::stage::{BuildState, StagePlan, StageResult};
use crate::resources::ReleaseReport;

/// Everything the caller needs to report a run.
#[derive(Debug)]
pub struct RunOutcome {
    pub result: StageResult,
    /// Furthest state reached (assumed for skipped stages).
    pub furthest: BuildState,
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub release: ReleaseReport,
}

/// Executes a [`StagePlan`] against a [`BuildContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StageRunner {
    skip_through: usize,
}

impl StageRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip stages with ordinal `<= n`, except those marked always-run.
    pub fn skip_through(mut self, n: usize) -> Self {
        self.skip_through = n;
        self
    }

    pub fn run(&self, plan: &StagePlan, ctx: &mut BuildContext) -> RunOutcome {
        let mut guard = ReleaseGuard::new(ctx);
        let mut executed = Vec::new();
        let mut skipped = Vec::new();

        let result = self.run_stages(plan, guard.ctx(), &mut executed, &mut skipped);
        let furthest = guard.ctx().state();
        let release = guard.finish();

        if !release.is_clean() {
            warn!(
                failures = release.failures.len(),
                "some resources could not be released; manual cleanup may be required"
            );
        }

        RunOutcome {
            result,
            furthest,
            executed,
            skipped,
            release,
        }
    }

    fn run_stages(
        &self,
        plan: &StagePlan,
        ctx: &mut BuildContext,
        executed: &mut Vec<String>,
        skipped: &mut Vec<String>,
    ) -> StageResult {
        let total = plan.len();
        for (ordinal, stage) in plan.iter() {
            if ordinal <= self.skip_through && !stage.is_always_run() {
                info!(stage = stage.name(), ordinal, total, "skipped (resume)");
                ctx.assume_reached(stage.reaches());
                skipped.push(stage.name().to_string());
                continue;
            }

            if ctx.cancel.is_cancelled() {
                warn!(stage = stage.name(), "interrupted before stage start");
                return StageResult::Failure {
                    stage: stage.name().to_string(),
                    reason: anyhow!("run interrupted before stage '{}' started", stage.name()),
                };
            }

            info!(stage = stage.name(), ordinal, total, "stage started");
            ctx.enter_stage(stage.name());
            executed.push(stage.name().to_string());

            match stage.execute(ctx) {
                Ok(()) => {
                    ctx.complete_stage(stage.name(), stage.reaches());
                    info!(stage = stage.name(), state = %stage.reaches(), "stage finished");
                }
                Err(reason) => {
                    error!(stage = stage.name(), error = %format!("{:#}", reason), "stage failed");
                    return StageResult::Failure {
                        stage: stage.name().to_string(),
                        reason,
                    };
                }
            }
        }
        StageResult::Success
    }
}

/// Owns the context for the duration of a run and releases on every exit.
struct ReleaseGuard<'a> {
    ctx: &'a mut BuildContext,
    released: bool,
}

impl<'a> ReleaseGuard<'a> {
    fn new(ctx: &'a mut BuildContext) -> Self {
        Self {
            ctx,
            released: false,
        }
    }

    fn ctx(&mut self) -> &mut BuildContext {
        &mut *self.ctx
    }

    fn finish(mut self) -> ReleaseReport {
        self.released = true;
        self.ctx.release_resources()
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let report = self.ctx.release_resources();
            if !report.is_clean() {
                for failure in &report.failures {
                    warn!(%failure, "release failed during unwind");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::stage::Stage;
    use crate::config::BuildConfig;
    use crate::interrupt::CancelToken;
    use crate::testing::FakeExecutor;
    use std::cell::RefCell;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::path::PathBuf;
    use std::rc::Rc;

    fn context(exec: &FakeExecutor) -> BuildContext {
        BuildContext::new(
            BuildConfig::default(),
            Box::new(exec.clone()),
            CancelToken::new(),
        )
    }

    fn recording(name: &'static str, reaches: BuildState, log: &Rc<RefCell<Vec<String>>>) -> Stage {
        let log = Rc::clone(log);
        Stage::new(name, reaches, move |_| {
            log.borrow_mut().push(name.to_string());
            Ok(())
        })
    }

    fn mounting(name: &'static str, reaches: BuildState, path: &'static str) -> Stage {
        Stage::new(name, reaches, move |ctx| {
            ctx.track_mount(PathBuf::from(path));
            Ok(())
        })
    }

    #[test]
    fn test_runs_all_stages_in_order() {
        let exec = FakeExecutor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let plan = StagePlan::new(vec![
            recording("bootstrap", BuildState::Bootstrapped, &log),
            recording("mount", BuildState::Mounted, &log),
            recording("install", BuildState::PackagesInstalled, &log),
        ])
        .unwrap();

        let mut ctx = context(&exec);
        let outcome = StageRunner::new().run(&plan, &mut ctx);

        assert!(outcome.result.is_success());
        assert_eq!(*log.borrow(), vec!["bootstrap", "mount", "install"]);
        assert_eq!(ctx.completed(), ["bootstrap", "mount", "install"]);
        assert_eq!(outcome.furthest, BuildState::PackagesInstalled);
    }

    #[test]
    fn test_stops_at_first_failure() {
        let exec = FakeExecutor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let plan = StagePlan::new(vec![
            recording("bootstrap", BuildState::Bootstrapped, &log),
            Stage::new("mount", BuildState::Mounted, |_| anyhow::bail!("boom")),
            recording("install", BuildState::PackagesInstalled, &log),
        ])
        .unwrap();

        let mut ctx = context(&exec);
        let outcome = StageRunner::new().run(&plan, &mut ctx);

        assert_eq!(outcome.result.failed_stage(), Some("mount"));
        assert_eq!(*log.borrow(), vec!["bootstrap"]);
        assert_eq!(outcome.executed, vec!["bootstrap", "mount"]);
        assert_eq!(outcome.furthest, BuildState::Bootstrapped);
    }

    #[test]
    fn test_releases_across_stages_lifo_on_failure() {
        let exec = FakeExecutor::new();
        let plan = StagePlan::new(vec![
            mounting("mount", BuildState::Mounted, "/r/proc"),
            mounting("install", BuildState::PackagesInstalled, "/r/sys"),
            Stage::new("customize", BuildState::Customized, |_| anyhow::bail!("late failure")),
        ])
        .unwrap();

        let mut ctx = context(&exec);
        let outcome = StageRunner::new().run(&plan, &mut ctx);

        assert!(!outcome.result.is_success());
        assert_eq!(outcome.release.released.len(), ctx.tracker.acquired_total());
        assert_eq!(
            exec.commands_for("umount"),
            vec!["umount /r/sys", "umount /r/proc"]
        );
        assert!(ctx.tracker.is_empty());
    }

    #[test]
    fn test_release_runs_once_on_success() {
        let exec = FakeExecutor::new();
        let plan = StagePlan::new(vec![mounting("mount", BuildState::Mounted, "/r/proc")]).unwrap();

        let mut ctx = context(&exec);
        let outcome = StageRunner::new().run(&plan, &mut ctx);
        // A second explicit release is a no-op.
        let again = ctx.release_resources();

        assert!(outcome.result.is_success());
        assert_eq!(outcome.release.released.len(), 1);
        assert_eq!(again.attempted(), 0);
        assert_eq!(exec.commands_for("umount").len(), 1);
    }

    #[test]
    fn test_skip_through_honours_always_run() {
        let exec = FakeExecutor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let plan = StagePlan::new(vec![
            recording("bootstrap", BuildState::Bootstrapped, &log),
            recording("mount", BuildState::Mounted, &log).always_run(),
            recording("install", BuildState::PackagesInstalled, &log),
            recording("customize", BuildState::Customized, &log),
        ])
        .unwrap();

        let mut ctx = context(&exec);
        let outcome = StageRunner::new().skip_through(3).run(&plan, &mut ctx);

        assert!(outcome.result.is_success());
        assert_eq!(*log.borrow(), vec!["mount", "customize"]);
        assert_eq!(outcome.skipped, vec!["bootstrap", "install"]);
        assert_eq!(outcome.furthest, BuildState::Customized);
    }

    #[test]
    fn test_interrupt_stops_before_next_stage() {
        let exec = FakeExecutor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let plan = StagePlan::new(vec![
            Stage::new("mount", BuildState::Mounted, |ctx| {
                ctx.track_mount(PathBuf::from("/r/proc"));
                ctx.cancel.cancel();
                Ok(())
            }),
            recording("install", BuildState::PackagesInstalled, &log),
        ])
        .unwrap();

        let mut ctx = context(&exec);
        let outcome = StageRunner::new().run(&plan, &mut ctx);

        assert_eq!(outcome.result.failed_stage(), Some("install"));
        assert!(log.borrow().is_empty());
        assert_eq!(exec.commands_for("umount"), vec!["umount /r/proc"]);
    }

    #[test]
    fn test_panic_in_stage_still_releases() {
        let exec = FakeExecutor::new();
        let plan = StagePlan::new(vec![
            mounting("mount", BuildState::Mounted, "/r/proc"),
            Stage::new("install", BuildState::PackagesInstalled, |_| {
                panic!("stage bug")
            }),
        ])
        .unwrap();

        let mut ctx = context(&exec);
        let result = catch_unwind(AssertUnwindSafe(|| StageRunner::new().run(&plan, &mut ctx)));

        assert!(result.is_err());
        assert_eq!(exec.commands_for("umount"), vec!["umount /r/proc"]);
    }
}

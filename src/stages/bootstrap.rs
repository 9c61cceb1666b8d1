//! Bootstrap: a fresh minimal root filesystem at the target root.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::build::context::BuildContext;
use crate::build::filesystem::is_empty_or_missing;
use crate::build::stage::{BuildState, Stage};
use crate::error::PreconditionError;
use crate::executor::Operation;

pub const NAME: &str = "bootstrap";

pub fn stage() -> Stage {
    Stage::new(NAME, BuildState::Bootstrapped, run)
}

/// Refuse a populated root unless reuse was requested.
///
/// This is also the only thing keeping two runs off the same root.
pub fn check_target(root: &Path, reuse: bool) -> Result<()> {
    if !reuse && !is_empty_or_missing(root)? {
        return Err(PreconditionError::TargetNotEmpty(root.to_path_buf()).into());
    }
    Ok(())
}

/// A root that already carries a package database.
fn looks_bootstrapped(root: &Path) -> bool {
    root.join("var/lib/dpkg/status").is_file()
}

pub fn debootstrap_operation(ctx: &BuildContext) -> Operation {
    let build = &ctx.config.build;
    Operation::new("debootstrap")
        .args(["--arch", build.arch.as_str()])
        .arg("--variant=minbase")
        .arg(build.release.as_str())
        .arg_path(ctx.target_root())
        .arg(build.mirror.as_str())
        .timeout(ctx.config.timeouts.bootstrap())
}

fn run(ctx: &mut BuildContext) -> Result<()> {
    let root = ctx.target_root().to_path_buf();
    let reuse = ctx.config.build.reuse_target;
    check_target(&root, reuse)?;

    if reuse && looks_bootstrapped(&root) {
        info!(root = %root.display(), "reusing existing root filesystem");
        return Ok(());
    }

    fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create target root {}", root.display()))?;
    ctx.exec(&debootstrap_operation(ctx)).with_context(|| {
        format!(
            "Failed to bootstrap {} into {}",
            ctx.config.build.release,
            root.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::error::FailureClass;
    use crate::interrupt::CancelToken;
    use crate::testing::FakeExecutor;
    use tempfile::TempDir;

    fn context(exec: &FakeExecutor, root: &Path, reuse: bool) -> BuildContext {
        let mut config = BuildConfig::default();
        config.build.target_root = root.to_path_buf();
        config.build.reuse_target = reuse;
        BuildContext::new(config, Box::new(exec.clone()), CancelToken::new())
    }

    #[test]
    fn test_bootstraps_missing_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("chroot");
        let exec = FakeExecutor::new();
        let mut ctx = context(&exec, &root, false);

        stage().execute(&mut ctx).unwrap();

        assert!(root.is_dir());
        assert_eq!(
            exec.commands(),
            vec![format!(
                "debootstrap --arch amd64 --variant=minbase bookworm {} http://deb.debian.org/debian",
                root.display()
            )]
        );
    }

    #[test]
    fn test_non_empty_root_is_precondition_failure() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("leftover"), "stale").unwrap();
        let exec = FakeExecutor::new();
        let mut ctx = context(&exec, temp.path(), false);

        let err = stage().execute(&mut ctx).unwrap_err();

        assert_eq!(FailureClass::of(&err), FailureClass::Precondition);
        assert!(exec.commands().is_empty());
        assert_eq!(ctx.tracker.acquired_total(), 0);
    }

    #[test]
    fn test_reuse_skips_bootstrapped_root() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("var/lib/dpkg")).unwrap();
        fs::write(temp.path().join("var/lib/dpkg/status"), "").unwrap();
        let exec = FakeExecutor::new();
        let mut ctx = context(&exec, temp.path(), true);

        stage().execute(&mut ctx).unwrap();

        assert!(exec.commands().is_empty());
    }
}

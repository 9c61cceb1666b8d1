//! Install: refresh the package index once, then install every package list.
//!
//! Package-list files are plain text: one or more names per line, `#`
//! starts a comment. Their content is opaque to the pipeline.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::build::context::BuildContext;
use crate::build::stage::{BuildState, Stage};
use crate::error::PreconditionError;
use crate::executor::Operation;

pub const NAME: &str = "install";

/// Installed before any list: what every live image needs to boot.
pub fn base_packages(arch: &str) -> Vec<String> {
    vec![
        format!("linux-image-{}", arch),
        "live-boot".to_string(),
        "systemd-sysv".to_string(),
        "locales".to_string(),
    ]
}

pub fn stage() -> Stage {
    Stage::new(NAME, BuildState::PackagesInstalled, run)
}

/// Parse package names out of a list file's text.
pub fn parse_package_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(str::split_whitespace)
        .map(str::to_string)
        .collect()
}

pub fn read_package_list(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Err(PreconditionError::MissingInput {
            what: "package list",
            path: path.to_path_buf(),
        }
        .into());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read package list {}", path.display()))?;
    Ok(parse_package_list(&text))
}

fn apt_install(ctx: &BuildContext, packages: &[String]) -> Operation {
    Operation::in_chroot(ctx.target_root(), "apt-get")
        .args(["install", "-y", "--no-install-recommends"])
        .args(packages.iter().cloned())
        .timeout(ctx.config.timeouts.install())
}

fn run(ctx: &mut BuildContext) -> Result<()> {
    let refresh = Operation::in_chroot(ctx.target_root(), "apt-get")
        .arg("update")
        .timeout(ctx.config.timeouts.install());
    ctx.exec(&refresh)
        .context("Failed to refresh package indexes")?;

    let base = base_packages(&ctx.config.build.arch);
    ctx.exec(&apt_install(ctx, &base))
        .context("Failed to install base live-system packages")?;

    for list in ctx.config.inputs.package_lists.clone() {
        let packages = read_package_list(&list)?;
        if packages.is_empty() {
            info!(list = %list.display(), "package list is empty; nothing to install");
            continue;
        }
        info!(list = %list.display(), count = packages.len(), "installing package list");
        ctx.exec(&apt_install(ctx, &packages))
            .with_context(|| format!("Failed to install package list {}", list.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::interrupt::CancelToken;
    use crate::testing::FakeExecutor;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn context(exec: &FakeExecutor, lists: Vec<PathBuf>) -> BuildContext {
        let mut config = BuildConfig::default();
        config.build.target_root = PathBuf::from("/build/chroot");
        config.inputs.package_lists = lists;
        BuildContext::new(config, Box::new(exec.clone()), CancelToken::new())
    }

    #[test]
    fn test_parse_package_list() {
        let text = "# network tools\ncurl wget\n\n  nmap # scanner\n#disabled\n";
        assert_eq!(parse_package_list(text), vec!["curl", "wget", "nmap"]);
    }

    #[test]
    fn test_installs_each_list_in_chroot() {
        let temp = TempDir::new().unwrap();
        let net = temp.path().join("net.list");
        let empty = temp.path().join("empty.list");
        fs::write(&net, "curl\n").unwrap();
        fs::write(&empty, "# nothing yet\n").unwrap();
        let exec = FakeExecutor::new();
        let mut ctx = context(&exec, vec![net, empty]);

        stage().execute(&mut ctx).unwrap();

        assert_eq!(
            exec.commands(),
            vec![
                "chroot /build/chroot apt-get update",
                "chroot /build/chroot apt-get install -y --no-install-recommends \
                 linux-image-amd64 live-boot systemd-sysv locales",
                "chroot /build/chroot apt-get install -y --no-install-recommends curl",
            ]
        );
    }

    #[test]
    fn test_failing_list_is_fatal() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("first.list");
        let second = temp.path().join("second.list");
        fs::write(&first, "nosuchpkg\n").unwrap();
        fs::write(&second, "curl\n").unwrap();
        let exec = FakeExecutor::new();
        exec.fail_matching("nosuchpkg", "E: Unable to locate package nosuchpkg");
        let mut ctx = context(&exec, vec![first.clone(), second]);

        let err = stage().execute(&mut ctx).unwrap_err();

        assert!(err.to_string().contains(&first.display().to_string()));
        assert!(!exec.commands().iter().any(|c| c.ends_with(" curl")));
    }

    #[test]
    fn test_missing_list_is_reported() {
        let err = read_package_list(Path::new("/nonexistent/base.list")).unwrap_err();
        assert!(err.downcast_ref::<PreconditionError>().is_some());
    }
}

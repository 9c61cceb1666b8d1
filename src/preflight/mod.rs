//! Preflight checks for build validation.
//!
//! Everything here is read-only: tools are located, never run, and the
//! target root is inspected, never touched. A dry run stops after these
//! checks.
//!
//! # Example
//!
//! ```rust,ignore
//! use forge_builder::preflight::check_required_tools;
//!
//! let tools = &[("mksquashfs", "squashfs-tools"), ("xorriso", "xorriso")];
//! if let Err(e) = check_required_tools(&executor, tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use crate::config::BuildConfig;
use crate::error::PreconditionError;
use crate::executor::Executor;
use crate::pipeline::BuildOptions;
use crate::stages::bootstrap::check_target;
use crate::stages::install::read_package_list;

/// Host tools every build needs. Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("debootstrap", "debootstrap"),
    ("chroot", "coreutils"),
    ("mount", "mount"),
    ("umount", "mount"),
    ("mksquashfs", "squashfs-tools"),
    ("grub-mkrescue", "grub-common"),
    ("xorriso", "xorriso"),
];

pub const MD5_TOOL: (&str, &str) = ("md5sum", "coreutils");

pub const QEMU_TOOL: (&str, &str) = ("qemu-system-x86_64", "qemu-system-x86");

/// What preflight found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub tools: Vec<(String, PathBuf)>,
    /// Each package list with the number of packages it names.
    pub package_lists: Vec<(PathBuf, usize)>,
}

impl PreflightReport {
    pub fn package_count(&self) -> usize {
        self.package_lists.iter().map(|(_, count)| count).sum()
    }
}

/// Tools required for this configuration.
pub fn required_tools(config: &BuildConfig, options: &BuildOptions) -> Vec<(&'static str, &'static str)> {
    let mut tools = REQUIRED_TOOLS.to_vec();
    if config.build.md5 {
        tools.push(MD5_TOOL);
    }
    if options.verify_boot {
        tools.push(QEMU_TOOL);
    }
    tools
}

/// Check that specific tools are available.
///
/// Returns the located paths, or every missing tool with its package.
pub fn check_required_tools(
    exec: &dyn Executor,
    tools: &[(&str, &str)],
) -> Result<Vec<(String, PathBuf)>, PreconditionError> {
    let mut found = Vec::new();
    let mut missing = Vec::new();

    for (tool, package) in tools {
        match exec.locate(tool) {
            Some(path) => found.push((tool.to_string(), path)),
            None => missing.push((tool.to_string(), package.to_string())),
        }
    }

    if !missing.is_empty() {
        return Err(PreconditionError::MissingTools(missing));
    }
    Ok(found)
}

fn current_euid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

fn check_root(config: &BuildConfig, options: &BuildOptions) -> Result<(), PreconditionError> {
    if !config.build.require_root || options.dry_run {
        return Ok(());
    }
    match current_euid() {
        0 => Ok(()),
        euid => Err(PreconditionError::NotRoot(euid)),
    }
}

fn check_input_dirs(config: &BuildConfig) -> Result<(), PreconditionError> {
    let dirs = [
        ("branding directory", &config.inputs.branding_dir),
        ("service units directory", &config.inputs.service_units_dir),
    ];
    for (what, dir) in dirs {
        if let Some(dir) = dir {
            if !dir.is_dir() {
                return Err(PreconditionError::MissingInput {
                    what,
                    path: dir.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Validate the host and the inputs before anything is mutated.
pub fn run_preflight(
    config: &BuildConfig,
    options: &BuildOptions,
    exec: &dyn Executor,
) -> Result<PreflightReport> {
    check_root(config, options)?;

    let tools = check_required_tools(exec, &required_tools(config, options))?;

    // A resumed run starts from an already-bootstrapped root.
    if options.skip_through == 0 {
        check_target(&config.build.target_root, config.build.reuse_target)?;
    }

    let mut package_lists = Vec::new();
    for list in &config.inputs.package_lists {
        let packages = read_package_list(list)?;
        package_lists.push((list.clone(), packages.len()));
    }
    check_input_dirs(config)?;

    let report = PreflightReport {
        tools,
        package_lists,
    };
    info!(
        tools = report.tools.len(),
        lists = report.package_lists.len(),
        packages = report.package_count(),
        "preflight passed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExecutor;
    use std::fs;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> BuildConfig {
        let mut config = BuildConfig::default();
        config.build.target_root = temp.path().join("chroot");
        config.build.require_root = false;
        config
    }

    #[test]
    fn test_check_required_tools_reports_all_missing() {
        let exec = FakeExecutor::new();
        exec.missing_tool("mksquashfs");
        exec.missing_tool("xorriso");

        let err = check_required_tools(&exec, REQUIRED_TOOLS).unwrap_err();

        let PreconditionError::MissingTools(missing) = err else {
            panic!("expected MissingTools");
        };
        assert_eq!(
            missing,
            vec![
                ("mksquashfs".to_string(), "squashfs-tools".to_string()),
                ("xorriso".to_string(), "xorriso".to_string()),
            ]
        );
        assert!(exec.commands().is_empty());
    }

    #[test]
    fn test_optional_tools_follow_config() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.build.md5 = true;
        let options = BuildOptions {
            verify_boot: true,
            ..Default::default()
        };

        let tools = required_tools(&config, &options);

        assert!(tools.contains(&MD5_TOOL));
        assert!(tools.contains(&QEMU_TOOL));
    }

    #[test]
    fn test_preflight_counts_packages() {
        let temp = TempDir::new().unwrap();
        let list = temp.path().join("base.list");
        fs::write(&list, "curl\njq # json\n").unwrap();
        let mut config = config(&temp);
        config.inputs.package_lists = vec![list];

        let report = run_preflight(&config, &BuildOptions::default(), &FakeExecutor::new()).unwrap();

        assert_eq!(report.package_count(), 2);
        assert_eq!(report.tools.len(), REQUIRED_TOOLS.len());
    }

    #[test]
    fn test_resume_skips_target_check() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        fs::create_dir_all(config.build.target_root.join("etc")).unwrap();
        let exec = FakeExecutor::new();

        assert!(run_preflight(&config, &BuildOptions::default(), &exec).is_err());
        let resume = BuildOptions {
            skip_through: 1,
            ..Default::default()
        };
        assert!(run_preflight(&config, &resume, &exec).is_ok());
    }

    #[test]
    fn test_missing_branding_dir() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.inputs.branding_dir = Some(temp.path().join("branding"));

        let err = run_preflight(&config, &BuildOptions::default(), &FakeExecutor::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PreconditionError>(),
            Some(PreconditionError::MissingInput { .. })
        ));
    }
}

//! Bootable ISO authoring.
//!
//! The staging tree handed to `grub-mkrescue` looks like:
//!
//! ```text
//! .staging/
//!   boot/grub/grub.cfg
//!   live/vmlinuz
//!   live/initrd.img
//!   live/filesystem.squashfs
//! ```

use anyhow::{bail, Context, Result};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::build::filesystem::{atomic_move, remove_file_if_exists};
use crate::executor::{Executor, Operation};

pub const ISO_LIVE_DIR: &str = "live";
pub const ISO_GRUB_DIR: &str = "boot/grub";

/// Options for building an ISO image.
#[derive(Debug, Clone)]
pub struct IsoOptions<'a> {
    /// Volume label (used by live-boot to find the medium).
    pub label: &'a str,

    /// OS name for GRUB menu entries.
    pub os_name: &'a str,

    /// Additional kernel command line options, appended to every entry.
    pub cmdline: &'a str,

    pub timeout: Option<Duration>,
}

impl<'a> IsoOptions<'a> {
    pub fn new(label: &'a str, os_name: &'a str) -> Self {
        Self {
            label,
            os_name,
            cmdline: "",
            timeout: None,
        }
    }
}

/// One GRUB menu entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub id: &'static str,
    pub title: &'static str,
    pub params: &'static str,
}

/// Normal, persistent and forensic (no-write) boot.
pub const BOOT_ENTRIES: &[BootEntry] = &[
    BootEntry {
        id: "live",
        title: "Live",
        params: "",
    },
    BootEntry {
        id: "persistent",
        title: "Live (persistent)",
        params: "persistence",
    },
    BootEntry {
        id: "forensic",
        title: "Live (forensic, no disk writes)",
        params: "noswap nopersistence ro",
    },
];

/// Render `grub.cfg` for the staging tree.
pub fn render_grub_cfg(options: &IsoOptions) -> String {
    let mut cfg = String::new();
    cfg.push_str("set default=0\n");
    cfg.push_str("set timeout=5\n");
    cfg.push_str(&format!("search --no-floppy --set=root --label {}\n\n", options.label));

    for entry in BOOT_ENTRIES {
        let mut cmdline = format!("boot=live live-media-label={}", options.label);
        for extra in [entry.params, options.cmdline] {
            if !extra.is_empty() {
                cmdline.push(' ');
                cmdline.push_str(extra);
            }
        }
        cfg.push_str(&format!(
            "menuentry \"{} {}\" --id {} {{\n    linux /{}/vmlinuz {}\n    initrd /{}/initrd.img\n}}\n\n",
            options.os_name, entry.title, entry.id, ISO_LIVE_DIR, cmdline, ISO_LIVE_DIR
        ));
    }
    cfg
}

/// Write `boot/grub/grub.cfg` into the staging tree.
pub fn write_grub_cfg(staging: &Path, options: &IsoOptions) -> Result<PathBuf> {
    let dir = staging.join(ISO_GRUB_DIR);
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join("grub.cfg");
    fs::write(&path, render_grub_cfg(options))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Copy the newest kernel and its initrd from `root/boot` into `staging/live`.
pub fn stage_boot_files(root: &Path, staging: &Path) -> Result<String> {
    let boot = root.join("boot");
    let mut versions = Vec::new();
    for entry in fs::read_dir(&boot)
        .with_context(|| format!("Failed to read {}", boot.display()))?
    {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if let Some(version) = name.strip_prefix("vmlinuz-") {
            versions.push(version.to_string());
        }
    }
    versions.sort_by(|a, b| compare_versions(a, b));
    let Some(version) = versions.pop() else {
        bail!(
            "No kernel found in {} (is linux-image installed?)",
            boot.display()
        );
    };

    let kernel = boot.join(format!("vmlinuz-{}", version));
    let initrd = boot.join(format!("initrd.img-{}", version));
    if !initrd.is_file() {
        bail!("Kernel {} has no matching {}", version, initrd.display());
    }

    let live = staging.join(ISO_LIVE_DIR);
    fs::create_dir_all(&live).with_context(|| format!("Failed to create {}", live.display()))?;
    fs::copy(&kernel, live.join("vmlinuz"))
        .with_context(|| format!("Failed to copy {}", kernel.display()))?;
    fs::copy(&initrd, live.join("initrd.img"))
        .with_context(|| format!("Failed to copy {}", initrd.display()))?;
    Ok(version)
}

/// Compare version strings chunk by chunk, numerically where both are digits.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |s: &str| -> Vec<String> {
        let mut chunks: Vec<String> = Vec::new();
        for c in s.chars() {
            match chunks.last_mut() {
                Some(last)
                    if last.chars().all(|l| l.is_ascii_digit()) == c.is_ascii_digit() =>
                {
                    last.push(c)
                }
                _ => chunks.push(c.to_string()),
            }
        }
        chunks
    };
    let (left, right) = (split(a), split(b));
    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

/// Author the ISO from `staging`.
///
/// The image is written to `<output>.partial` and renamed into place only
/// after `grub-mkrescue` succeeds, so `output` never names a half-written
/// file.
pub fn build_iso(
    exec: &dyn Executor,
    staging: &Path,
    output: &Path,
    options: &IsoOptions,
) -> Result<()> {
    let partial = partial_path(output);
    let op = Operation::new("grub-mkrescue")
        .arg("-o")
        .arg_path(&partial)
        .arg_path(staging)
        .args(["--", "-volid", options.label])
        .timeout(options.timeout);

    if let Err(err) = exec.run(&op) {
        remove_file_if_exists(&partial)?;
        return Err(err).context("grub-mkrescue failed. Install grub-pc-bin, grub-efi-amd64-bin and xorriso.");
    }
    if !partial.is_file() {
        bail!("grub-mkrescue reported success but wrote no image at {}", partial.display());
    }
    atomic_move(&partial, output)
}

pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExecutor;
    use tempfile::TempDir;

    #[test]
    fn test_grub_cfg_has_three_entries() {
        let cfg = render_grub_cfg(&IsoOptions::new("FORGE_OS", "Forge OS"));

        assert_eq!(cfg.matches("menuentry").count(), 3);
        assert_eq!(cfg.matches("boot=live live-media-label=FORGE_OS").count(), 3);
        assert!(cfg.contains("--id persistent {\n    linux /live/vmlinuz boot=live live-media-label=FORGE_OS persistence\n"));
        assert!(cfg.contains("noswap nopersistence ro"));
        assert!(cfg.contains("search --no-floppy --set=root --label FORGE_OS"));
    }

    #[test]
    fn test_extra_cmdline_is_appended() {
        let mut options = IsoOptions::new("L", "Forge OS");
        options.cmdline = "quiet splash";
        let cfg = render_grub_cfg(&options);
        assert_eq!(cfg.matches("quiet splash").count(), 3);
    }

    #[test]
    fn test_stage_boot_files_picks_newest_kernel() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let staging = temp.path().join("staging");
        fs::create_dir_all(root.join("boot")).unwrap();
        for version in ["6.1.0-9-amd64", "6.1.0-10-amd64"] {
            fs::write(root.join(format!("boot/vmlinuz-{}", version)), version).unwrap();
            fs::write(root.join(format!("boot/initrd.img-{}", version)), version).unwrap();
        }

        let version = stage_boot_files(&root, &staging).unwrap();

        assert_eq!(version, "6.1.0-10-amd64");
        assert_eq!(
            fs::read_to_string(staging.join("live/vmlinuz")).unwrap(),
            "6.1.0-10-amd64"
        );
        assert!(staging.join("live/initrd.img").is_file());
    }

    #[test]
    fn test_stage_boot_files_requires_kernel() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("root/boot")).unwrap();
        let err = stage_boot_files(&temp.path().join("root"), &temp.path().join("s")).unwrap_err();
        assert!(err.to_string().contains("No kernel found"));
    }

    #[test]
    fn test_build_iso_renames_partial() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("forge.iso");
        let exec = FakeExecutor::new();
        exec.on("grub-mkrescue", |op| fs::write(&op.args[1], "iso"));

        build_iso(&exec, temp.path(), &output, &IsoOptions::new("FORGE_OS", "Forge OS")).unwrap();

        assert!(output.is_file());
        assert!(!partial_path(&output).exists());
        assert!(exec.commands()[0].ends_with("-- -volid FORGE_OS"));
    }

    #[test]
    fn test_build_iso_failure_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("forge.iso");
        fs::write(partial_path(&output), "half").unwrap();
        let exec = FakeExecutor::new();
        exec.fail_nth("grub-mkrescue", 1, "xorriso : FAILURE");

        let result = build_iso(&exec, temp.path(), &output, &IsoOptions::new("L", "Forge OS"));

        assert!(result.is_err());
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }
}

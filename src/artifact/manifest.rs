//! Installed-package manifest shipped next to the image.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::executor::{Executor, Operation};

const DPKG_FORMAT: &str = "${Package}\\t${Version}\\n";

/// Query the target root's package database and return sorted
/// `<package>\t<version>` lines.
pub fn query_installed(exec: &dyn Executor, root: &Path) -> Result<Vec<String>> {
    let output = exec
        .run(&Operation::in_chroot(root, "dpkg-query").args(["-W", "-f", DPKG_FORMAT]))
        .context("Failed to enumerate installed packages")?;
    let mut lines: Vec<String> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    lines.sort();
    lines.dedup();
    Ok(lines)
}

/// Write the manifest file, one package per line.
pub fn write_manifest(path: &Path, lines: &[String]) -> Result<()> {
    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Package names listed in a manifest file.
pub fn read_package_names(path: &Path) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .filter_map(|line| line.split('\t').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect())
}

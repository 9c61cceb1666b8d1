//! Squashfs image builder.
//!
//! Wraps `mksquashfs`. The live virtual filesystems are still mounted in the
//! target root while this runs, so their contents are always excluded.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

use crate::executor::{Executor, Operation};

/// Directories whose contents never belong in the image.
pub const EXCLUDED_CONTENTS: &[&str] = &["proc/*", "sys/*", "dev/*", "run/*", "tmp/*"];

/// Options for building a squashfs image.
#[derive(Debug, Clone)]
pub struct SquashfsOptions<'a> {
    /// Compression algorithm (gzip, zstd, xz, lzo, lz4).
    ///
    /// Default: "xz" (smallest images, supported by every live kernel)
    pub compression: &'a str,

    /// Block size (e.g., "128K", "256K", "1M"). `None` keeps the tool default.
    pub block_size: Option<&'a str>,

    /// Whether to include extended attributes.
    pub xattrs: bool,

    pub timeout: Option<Duration>,
}

impl Default for SquashfsOptions<'_> {
    fn default() -> Self {
        Self {
            compression: "xz",
            block_size: None,
            xattrs: true,
            timeout: None,
        }
    }
}

/// The `mksquashfs` invocation for `source_dir` -> `output`.
pub fn squashfs_operation(source_dir: &Path, output: &Path, options: &SquashfsOptions) -> Operation {
    let mut op = Operation::new("mksquashfs")
        .arg_path(source_dir)
        .arg_path(output)
        .args(["-noappend", "-comp", options.compression]);
    if let Some(block_size) = options.block_size {
        op = op.args(["-b", block_size]);
    }
    if !options.xattrs {
        op = op.arg("-no-xattrs");
    }
    op.arg("-wildcards")
        .arg("-e")
        .args(EXCLUDED_CONTENTS.iter().copied())
        .timeout(options.timeout)
}

/// Build a squashfs image from a directory.
pub fn build_squashfs(
    exec: &dyn Executor,
    source_dir: &Path,
    output: &Path,
    options: &SquashfsOptions,
) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    exec.run(&squashfs_operation(source_dir, output, options))
        .context("mksquashfs failed. Install squashfs-tools.")?;
    Ok(())
}

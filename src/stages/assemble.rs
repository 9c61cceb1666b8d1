//! Assemble: turn the customized root into a checksummed live ISO.
//!
//! Every step can fail on its own. The ISO, its checksums and the package
//! manifest are written under `<output>/.pending` and only renamed into the
//! output directory once every step has succeeded, so a failed run never
//! touches the outputs of an earlier good run. Both `.staging` and
//! `.pending` are tracked directories and go away with the rest of the
//! run's resources.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::artifact::checksum::{checksum_path, md5_via_host, sha256_file, write_checksum_file};
use crate::artifact::iso::{build_iso, stage_boot_files, write_grub_cfg, IsoOptions};
use crate::artifact::manifest::{query_installed, write_manifest};
use crate::artifact::squashfs::{build_squashfs, SquashfsOptions};
use crate::artifact::{BuildArtifact, ChecksumSet};
use crate::build::context::BuildContext;
use crate::build::filesystem::{atomic_move, clear_dir_contents, remove_file_if_exists};
use crate::build::stage::{BuildState, Stage};
use crate::executor::{resolve_in_root, Operation};
use crate::verify::SERIAL_CONSOLE;

pub const NAME: &str = "assemble";

/// ISO source tree handed to `grub-mkrescue`.
pub const STAGING_DIR: &str = ".staging";

/// Outputs of this run awaiting publication.
pub const PENDING_DIR: &str = ".pending";

pub fn stage() -> Stage {
    Stage::new(NAME, BuildState::Assembled, run)
}

/// Where each output of this stage lands.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub staging: PathBuf,
    pub pending: PathBuf,
    pub iso: PathBuf,
    pub manifest: PathBuf,
}

impl OutputLayout {
    pub fn for_context(ctx: &BuildContext) -> Self {
        let output = ctx.output_dir();
        let iso = output.join(ctx.config.image_file_name());
        Self {
            staging: output.join(STAGING_DIR),
            pending: output.join(PENDING_DIR),
            manifest: iso.with_extension("packages"),
            iso,
        }
    }

    /// Location of a final output while it is still pending.
    fn pending_for(&self, published: &Path) -> PathBuf {
        match published.file_name() {
            Some(name) => self.pending.join(name),
            None => self.pending.join("output"),
        }
    }
}

fn run(ctx: &mut BuildContext) -> Result<()> {
    let layout = OutputLayout::for_context(ctx);
    fs::create_dir_all(ctx.output_dir())
        .with_context(|| format!("Failed to create {}", ctx.output_dir().display()))?;

    for dir in [&layout.staging, &layout.pending] {
        if dir.exists() {
            fs::remove_dir_all(dir)
                .with_context(|| format!("Failed to remove stale tree {}", dir.display()))?;
        }
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        ctx.track_directory(dir.clone());
    }

    match assemble(ctx, &layout) {
        Ok(artifact) => {
            info!(
                image = %artifact.image_path.display(),
                size_bytes = artifact.size_bytes,
                sha256 = %artifact.checksums.sha256,
                "image assembled"
            );
            ctx.set_artifact(artifact);
            Ok(())
        }
        Err(err) => {
            if let Err(cleanup) = clear_dir_contents(&layout.pending) {
                warn!(path = %layout.pending.display(), error = %cleanup, "could not remove incomplete outputs");
            }
            Err(err)
        }
    }
}

fn assemble(ctx: &BuildContext, layout: &OutputLayout) -> Result<BuildArtifact> {
    let root = ctx.target_root();

    finalize_root(ctx).context("Failed to finalize target root")?;

    let kernel = stage_boot_files(root, &layout.staging)?;
    info!(kernel = %kernel, "boot files staged");

    let pending_manifest = layout.pending_for(&layout.manifest);
    let packages = query_installed(ctx.executor(), root)?;
    write_manifest(&pending_manifest, &packages)?;
    info!(packages = packages.len(), "manifest written");

    let squashfs_options = SquashfsOptions {
        timeout: ctx.config.timeouts.squashfs(),
        ..Default::default()
    };
    build_squashfs(
        ctx.executor(),
        root,
        &layout.staging.join("live/filesystem.squashfs"),
        &squashfs_options,
    )?;

    let pending_iso = layout.pending_for(&layout.iso);
    let mut iso_options = IsoOptions::new(ctx.label(), &ctx.config.build.image_name);
    iso_options.cmdline = SERIAL_CONSOLE;
    iso_options.timeout = ctx.config.timeouts.iso();
    write_grub_cfg(&layout.staging, &iso_options)?;
    build_iso(ctx.executor(), &layout.staging, &pending_iso, &iso_options)?;

    let (sha256, size_bytes) = sha256_file(&pending_iso)?;
    write_checksum_file(&pending_iso, "sha256", &sha256)?;
    let md5 = if ctx.config.build.md5 {
        let md5 = md5_via_host(ctx.executor(), &pending_iso)?;
        write_checksum_file(&pending_iso, "md5", &md5)?;
        Some(md5)
    } else {
        None
    };

    let checksum_files = publish(layout, md5.is_some())?;
    Ok(BuildArtifact {
        image_path: layout.iso.clone(),
        size_bytes,
        checksums: ChecksumSet { sha256, md5 },
        manifest_path: layout.manifest.clone(),
        checksum_files,
    })
}

/// Move the pending outputs into place and return the checksum files.
///
/// Old checksum files go first, so an earlier image is never left next to
/// a digest of the new one.
fn publish(layout: &OutputLayout, with_md5: bool) -> Result<Vec<PathBuf>> {
    let mut suffixes = vec!["sha256"];
    if with_md5 {
        suffixes.push("md5");
    }

    for suffix in ["sha256", "md5"] {
        remove_file_if_exists(&checksum_path(&layout.iso, suffix))?;
    }
    atomic_move(&layout.pending_for(&layout.iso), &layout.iso)?;

    let mut checksum_files = Vec::new();
    for suffix in suffixes {
        let published = checksum_path(&layout.iso, suffix);
        atomic_move(&layout.pending_for(&published), &published)?;
        checksum_files.push(published);
    }
    atomic_move(&layout.pending_for(&layout.manifest), &layout.manifest)?;
    Ok(checksum_files)
}

/// Drop package caches and scratch files from the image.
fn finalize_root(ctx: &BuildContext) -> Result<()> {
    let root = ctx.target_root();
    ctx.exec(&Operation::in_chroot(root, "apt-get").arg("clean"))?;

    clear_dir_contents(&resolve_in_root(root, "var/lib/apt/lists")?)?;
    clear_dir_contents(&resolve_in_root(root, "tmp")?)?;

    let archives = resolve_in_root(root, "var/cache/apt/archives")?;
    if archives.is_dir() {
        for entry in fs::read_dir(&archives)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "deb") {
                remove_file_if_exists(&path)?;
            }
        }
    }
    Ok(())
}

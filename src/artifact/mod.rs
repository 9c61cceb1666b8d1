//! Artifact builders for the live image.
//!
//! - [`checksum`] - SHA-256 (in-process) and MD5 (host `md5sum`) digests
//! - [`iso`] - staging tree layout, GRUB configuration, `grub-mkrescue`
//! - [`manifest`] - installed-package manifest via `dpkg-query`
//! - [`squashfs`] - compressed root filesystem via `mksquashfs`
//!
//! The assemble stage strings these together and publishes a
//! [`BuildArtifact`] only once every step has succeeded.

pub mod checksum;
pub mod iso;
pub mod manifest;
pub mod squashfs;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Digests of the delivered image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSet {
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

/// The delivered image. Immutable once the assembler publishes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub image_path: PathBuf,
    pub size_bytes: u64,
    pub checksums: ChecksumSet,
    pub manifest_path: PathBuf,
    pub checksum_files: Vec<PathBuf>,
}

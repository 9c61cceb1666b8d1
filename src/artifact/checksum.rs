//! Image digests.
//!
//! SHA-256 is computed in-process. MD5 is optional and delegated to the host
//! `md5sum` through the executor. Both are written in the standard
//! `<hash>  <filename>` format so users can verify with
//! `cd out && sha256sum -c image.iso.sha256`.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::executor::{Executor, Operation};

/// Separator between digest and filename in checksum files.
const CHECKSUM_SEPARATOR: &str = "  ";

/// SHA-256 of a file, with its size in bytes.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Path of the checksum file for `image` with the given suffix.
pub fn checksum_path(image: &Path, suffix: &str) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Write `<hash>  <filename>` next to `image` and return the file's path.
pub fn write_checksum_file(image: &Path, suffix: &str, hash: &str) -> Result<PathBuf> {
    let filename = image
        .file_name()
        .context("Could not get image filename")?
        .to_string_lossy();
    let path = checksum_path(image, suffix);
    fs::write(&path, format!("{}{}{}\n", hash, CHECKSUM_SEPARATOR, filename))
        .with_context(|| format!("Failed to write {}", path.display()))?;

    if hash.len() >= 16 {
        info!(
            digest = %format!("{}...{}", &hash[..8], &hash[hash.len() - 8..]),
            path = %path.display(),
            "wrote {} checksum",
            suffix
        );
    }
    Ok(path)
}

/// MD5 of `image` via the host `md5sum`.
pub fn md5_via_host(exec: &dyn Executor, image: &Path) -> Result<String> {
    let output = exec
        .run(&Operation::new("md5sum").arg_path(image))
        .context("md5sum failed. Install coreutils.")?;
    let hash = output
        .stdout
        .split_whitespace()
        .next()
        .context("Could not parse md5sum output - no hash found")?;
    Ok(hash.to_string())
}

/// Re-read `image` and compare it against its `.sha256` file.
pub fn verify_sha256_file(image: &Path) -> Result<bool> {
    let path = checksum_path(image, "sha256");
    let recorded = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let expected = recorded
        .split_whitespace()
        .next()
        .with_context(|| format!("Empty checksum file: {}", path.display()))?;
    let (actual, _) = sha256_file(image)?;
    Ok(actual == expected)
}

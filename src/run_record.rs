//! Run record written to `<output>/run-manifest.json`.
//!
//! One record per non-dry run, written after resources are released so it
//! can list release failures alongside the primary outcome.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::artifact::BuildArtifact;

pub const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Success,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub furthest_state: String,
    pub completed_stages: Vec<String>,
    #[serde(default)]
    pub skipped_stages: Vec<String>,
    pub failed_stage: Option<String>,
    pub reason: Option<String>,
    pub exit_code: i32,
    #[serde(default)]
    pub release_failures: Vec<String>,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub artifact: Option<BuildArtifact>,
}

impl RunRecord {
    /// A record for a run that is starting now.
    pub fn start() -> Result<Self> {
        Ok(Self {
            run_id: generate_run_id()?,
            status: RunStatus::Failed,
            furthest_state: String::new(),
            completed_stages: Vec::new(),
            skipped_stages: Vec::new(),
            failed_stage: None,
            reason: None,
            exit_code: 1,
            release_failures: Vec::new(),
            created_at_utc: now_utc()?,
            finished_at_utc: None,
            artifact: None,
        })
    }

    pub fn finish(&mut self) -> Result<()> {
        self.finished_at_utc = Some(now_utc()?);
        Ok(())
    }

    pub fn write(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = manifest_path(output_dir);
        write_json_atomic(&path, self)
            .with_context(|| format!("writing run record '{}'", path.display()))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("reading run record '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run record '{}'", path.display()))
    }
}

pub fn manifest_path(output_dir: &Path) -> PathBuf {
    output_dir.join(RUN_MANIFEST_FILENAME)
}

fn now_utc() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting UTC timestamp")
}

/// Sortable, process-unique run identifier.
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    Ok(base62_encode_u128((nanos << 32) | pid | seq))
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    chars.iter().rev().collect()
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run record")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

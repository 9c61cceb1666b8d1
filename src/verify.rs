//! Boot smoke check for a finished ISO.
//!
//! Boots the image headless in QEMU with the serial console piped to a
//! reader thread and watches for success/failure patterns. This is a smoke
//! test, not full verification: it proves the kernel, initrd and live root
//! come up far enough to print a login prompt.
//!
//! The QEMU child is registered with its own [`ResourceTracker`], so it is
//! killed on every exit path: success, failure, deadline, interrupt.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::artifact::checksum::{checksum_path, verify_sha256_file};
use crate::executor::Executor;
use crate::interrupt::CancelToken;
use crate::resources::{ResourceTracker, TrackedResource};

pub const QEMU: &str = "qemu-system-x86_64";

/// Kernel arguments that put a console on the first serial port.
pub const SERIAL_CONSOLE: &str = "console=tty0 console=ttyS0,115200";

/// Success patterns - if we see any of these, boot succeeded.
pub const SUCCESS_PATTERNS: &[&str] = &["login:"];

/// Failure patterns - if we see any of these, boot failed.
pub const FAILURE_PATTERNS: &[&str] = &[
    "Kernel panic",
    "not syncing",
    "VFS: Cannot open root device",
    "No init found",
    "Unable to find a medium containing a live file system",
    "can't find /init",
    "emergency shell",
    "No bootable device",
    "Boot Failed",
];

const TAIL_LINES: usize = 20;

/// How a boot attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootVerdict {
    Booted { matched: String },
    Failed { pattern: String, tail: Vec<String> },
    TimedOut { tail: Vec<String> },
    Interrupted,
    /// QEMU exited (closed its console) before either pattern appeared.
    Exited { tail: Vec<String> },
}

impl BootVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, BootVerdict::Booted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineMatch {
    Success(&'static str),
    Failure(&'static str),
}

fn classify_line(line: &str) -> Option<LineMatch> {
    if let Some(pattern) = FAILURE_PATTERNS.iter().copied().find(|p| line.contains(p)) {
        return Some(LineMatch::Failure(pattern));
    }
    SUCCESS_PATTERNS
        .iter()
        .copied()
        .find(|p| line.contains(p))
        .map(LineMatch::Success)
}

/// Consume console lines until a verdict is reached.
pub fn watch_console(rx: &Receiver<String>, timeout: Duration, cancel: &CancelToken) -> BootVerdict {
    let start = Instant::now();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

    loop {
        if cancel.is_cancelled() {
            return BootVerdict::Interrupted;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return BootVerdict::TimedOut {
                tail: tail.into_iter().collect(),
            };
        }
        let wait = (timeout - elapsed).min(Duration::from_millis(100));

        match rx.recv_timeout(wait) {
            Ok(line) => {
                debug!(target: "forge_builder::console", "{}", line);
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
                match classify_line(&line) {
                    Some(LineMatch::Success(pattern)) => {
                        return BootVerdict::Booted {
                            matched: pattern.to_string(),
                        }
                    }
                    Some(LineMatch::Failure(pattern)) => {
                        return BootVerdict::Failed {
                            pattern: pattern.to_string(),
                            tail: tail.into_iter().collect(),
                        }
                    }
                    None => {}
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return BootVerdict::Exited {
                    tail: tail.into_iter().collect(),
                }
            }
        }
    }
}

/// Headless QEMU command booting `iso` from CD with serial on stdio.
pub fn qemu_command(iso: &Path, memory_gb: u32) -> Command {
    let mut cmd = Command::new(QEMU);
    if Path::new("/dev/kvm").exists() {
        cmd.args(["-enable-kvm", "-cpu", "host"]);
    } else {
        cmd.args(["-cpu", "max"]);
    }
    cmd.args(["-smp", "2"]);
    cmd.args(["-m", &format!("{}G", memory_gb)]);
    cmd.arg("-cdrom").arg(iso);
    cmd.args(["-boot", "d", "-nographic", "-serial", "mon:stdio", "-no-reboot"]);
    cmd
}

/// Boot `iso` and wait for a verdict.
///
/// `exec` is only used to locate QEMU and to release the tracked process.
pub fn smoke_boot(
    exec: &dyn Executor,
    iso: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<BootVerdict> {
    if !iso.is_file() {
        bail!("ISO not found at {}", iso.display());
    }
    if exec.locate(QEMU).is_none() {
        return Err(crate::error::ExecError::NotFound {
            program: QEMU.to_string(),
        }
        .into());
    }

    info!(iso = %iso.display(), timeout_secs = timeout.as_secs(), "starting boot smoke test");
    let mut cmd = qemu_command(iso, 2);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let mut child = cmd.spawn().with_context(|| format!("Failed to spawn {}", QEMU))?;

    let mut tracker = ResourceTracker::new();
    tracker.acquire(TrackedResource::process(child.id(), "verify"));

    let verdict = match child.stdout.take() {
        Some(stdout) => {
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines().map_while(std::io::Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
            Ok(watch_console(&rx, timeout, cancel))
        }
        None => Err(anyhow::anyhow!("Failed to capture QEMU serial console")),
    };

    let report = tracker.release_all(exec);
    if let Err(err) = child.wait() {
        warn!(error = %err, "could not reap QEMU");
    }
    if !report.is_clean() {
        warn!("QEMU may still be running; manual cleanup may be required");
    }
    verdict
}

/// Run the smoke test and turn anything but a boot into an error.
///
/// When the image has a `.sha256` file next to it, the digest is checked
/// first and a mismatch fails without booting.
pub fn verify_boot(
    exec: &dyn Executor,
    iso: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    if checksum_path(iso, "sha256").is_file() && !verify_sha256_file(iso)? {
        bail!("{} does not match its .sha256 file", iso.display());
    }
    match smoke_boot(exec, iso, timeout, cancel)? {
        BootVerdict::Booted { matched } => {
            info!(pattern = %matched, "boot smoke test passed");
            Ok(())
        }
        BootVerdict::Failed { pattern, tail } => bail!(
            "boot failed: saw '{}'\n\nLast output:\n{}",
            pattern,
            tail.join("\n")
        ),
        BootVerdict::TimedOut { tail } => bail!(
            "boot did not complete in {}s\n\nLast output:\n{}",
            timeout.as_secs(),
            tail.join("\n")
        ),
        BootVerdict::Exited { tail } => bail!(
            "QEMU exited before the system booted\n\nLast output:\n{}",
            tail.join("\n")
        ),
        BootVerdict::Interrupted => bail!("boot smoke test interrupted by operator"),
    }
}

//! Resource tracker - every externally visible thing a run acquires.
//!
//! Mounts, scratch directories and background processes are registered here
//! the moment they exist. [`ResourceTracker::release_all`] walks the list in
//! strict reverse acquisition order (LIFO), attempts every release even when
//! an earlier one fails, and is a no-op on the second call.
//!
//! # Example
//!
//! ```rust,ignore
//! let handle = tracker.acquire(TrackedResource::mount(root.join("proc"), "mount"));
//! // ... later stages ...
//! let report = tracker.release_all(&executor);
//! for failure in &report.failures {
//!     eprintln!("manual cleanup may be required: {failure}");
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ExecError;
use crate::executor::{Executor, Operation};

/// Upper bound for a single unmount attempt during release.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(60);

/// What kind of resource was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Mount,
    Directory,
    BackgroundProcess,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Mount => "mount",
            ResourceKind::Directory => "directory",
            ResourceKind::BackgroundProcess => "background-process",
        };
        f.write_str(name)
    }
}

/// Path or process identity of a tracked resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceTarget {
    Path(PathBuf),
    Pid(u32),
}

impl fmt::Display for ResourceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceTarget::Path(path) => write!(f, "{}", path.display()),
            ResourceTarget::Pid(pid) => write!(f, "pid {}", pid),
        }
    }
}

/// One acquired resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedResource {
    pub kind: ResourceKind,
    pub target: ResourceTarget,
    /// Name of the stage that acquired it.
    pub acquired_at: String,
}

impl TrackedResource {
    pub fn mount(path: impl Into<PathBuf>, stage: &str) -> Self {
        Self {
            kind: ResourceKind::Mount,
            target: ResourceTarget::Path(path.into()),
            acquired_at: stage.to_string(),
        }
    }

    pub fn directory(path: impl Into<PathBuf>, stage: &str) -> Self {
        Self {
            kind: ResourceKind::Directory,
            target: ResourceTarget::Path(path.into()),
            acquired_at: stage.to_string(),
        }
    }

    pub fn process(pid: u32, stage: &str) -> Self {
        Self {
            kind: ResourceKind::BackgroundProcess,
            target: ResourceTarget::Pid(pid),
            acquired_at: stage.to_string(),
        }
    }
}

impl fmt::Display for TrackedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (acquired in {})",
            self.kind, self.target, self.acquired_at
        )
    }
}

/// Opaque handle returned by [`ResourceTracker::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceHandle(usize);

/// A release attempt that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub resource: TrackedResource,
    pub reason: String,
}

impl fmt::Display for ReleaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.reason)
    }
}

/// Outcome of a [`ResourceTracker::release_all`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Successfully released, in release order.
    pub released: Vec<TrackedResource>,
    pub failures: Vec<ReleaseFailure>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.released.len() + self.failures.len()
    }
}

#[derive(Debug)]
struct Entry {
    handle: ResourceHandle,
    resource: TrackedResource,
}

/// Records acquired resources and releases them LIFO.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    live: Vec<Entry>,
    next: usize,
    acquired_total: usize,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource that now exists.
    pub fn acquire(&mut self, resource: TrackedResource) -> ResourceHandle {
        let handle = ResourceHandle(self.next);
        self.next += 1;
        self.acquired_total += 1;
        info!(resource = %resource, "acquired");
        self.live.push(Entry { handle, resource });
        handle
    }

    /// Resources still awaiting release, oldest first.
    pub fn live(&self) -> Vec<&TrackedResource> {
        self.live.iter().map(|entry| &entry.resource).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Total acquisitions over the tracker's lifetime.
    pub fn acquired_total(&self) -> usize {
        self.acquired_total
    }

    /// Release every live resource, newest first.
    ///
    /// Each resource is attempted exactly once: entries leave the live list
    /// before their release runs, so a second call finds nothing to do and
    /// never retries a resource that already failed.
    pub fn release_all(&mut self, exec: &dyn Executor) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        while let Some(entry) = self.live.pop() {
            let resource = entry.resource;
            match release_one(&resource, exec) {
                Ok(()) => {
                    info!(resource = %resource, "released");
                    report.released.push(resource);
                }
                Err(reason) => {
                    warn!(
                        resource = %resource,
                        reason = %reason,
                        "release failed; manual cleanup may be required"
                    );
                    report.failures.push(ReleaseFailure { resource, reason });
                }
            }
        }
        report
    }
}

fn release_one(resource: &TrackedResource, exec: &dyn Executor) -> Result<(), String> {
    match (&resource.kind, &resource.target) {
        (ResourceKind::Mount, ResourceTarget::Path(path)) => unmount(path, exec),
        (ResourceKind::Directory, ResourceTarget::Path(path)) => remove_directory(path),
        (ResourceKind::BackgroundProcess, ResourceTarget::Pid(pid)) => terminate(*pid),
        (kind, target) => Err(format!("{} cannot be released via {}", kind, target)),
    }
}

fn umount_operation(path: &Path, lazy: bool) -> Operation {
    let op = Operation::new("umount");
    let op = if lazy { op.arg("--lazy") } else { op };
    op.arg_path(path)
        .timeout(Some(RELEASE_TIMEOUT))
        .uncancellable()
}

fn unmount(path: &Path, exec: &dyn Executor) -> Result<(), String> {
    let first = match exec.run(&umount_operation(path, false)) {
        Ok(_) => return Ok(()),
        Err(err) => err,
    };
    if already_unmounted(&first) {
        return Ok(());
    }

    // Busy mounts (a stray process still holds a file open) detach lazily.
    match exec.run(&umount_operation(path, true)) {
        Ok(_) => Ok(()),
        Err(err) if already_unmounted(&err) => Ok(()),
        Err(err) => Err(format!("{}; lazy retry: {}", first, err)),
    }
}

fn already_unmounted(err: &ExecError) -> bool {
    err.output()
        .map(|out| out.contains("not mounted") || out.contains("no mount point specified"))
        .unwrap_or(false)
}

fn remove_directory(path: &Path) -> Result<(), String> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format!("removing {}: {}", path.display(), err)),
    }
}

fn terminate(pid: u32) -> Result<(), String> {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Err(format!("pid {} out of range", pid));
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already exited.
        return Ok(());
    }
    Err(format!("kill pid {}: {}", pid, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExecutor;
    use tempfile::TempDir;

    #[test]
    fn test_release_is_lifo() {
        let exec = FakeExecutor::new();
        let mut tracker = ResourceTracker::new();
        tracker.acquire(TrackedResource::mount("/r/proc", "mount"));
        tracker.acquire(TrackedResource::mount("/r/sys", "mount"));
        tracker.acquire(TrackedResource::mount("/r/dev", "mount"));

        let report = tracker.release_all(&exec);
        assert!(report.is_clean());

        let order: Vec<String> = report
            .released
            .iter()
            .map(|r| r.target.to_string())
            .collect();
        assert_eq!(order, vec!["/r/dev", "/r/sys", "/r/proc"]);
        assert_eq!(
            exec.commands_for("umount"),
            vec!["umount /r/dev", "umount /r/sys", "umount /r/proc"]
        );
    }

    #[test]
    fn test_release_continues_after_failure() {
        let exec = FakeExecutor::new();
        exec.fail_matching("umount /r/sys", "umount: /r/sys: target is busy");
        exec.fail_matching("umount --lazy /r/sys", "umount: /r/sys: permission denied");

        let mut tracker = ResourceTracker::new();
        tracker.acquire(TrackedResource::mount("/r/proc", "mount"));
        tracker.acquire(TrackedResource::mount("/r/sys", "mount"));
        tracker.acquire(TrackedResource::mount("/r/dev", "mount"));

        let report = tracker.release_all(&exec);
        assert_eq!(report.released.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            report.failures[0].resource.target,
            ResourceTarget::Path("/r/sys".into())
        );
        // /r/proc was still attempted after /r/sys failed.
        assert!(exec
            .commands_for("umount")
            .contains(&"umount /r/proc".to_string()));
    }

    #[test]
    fn test_release_all_is_idempotent() {
        let exec = FakeExecutor::new();
        let mut tracker = ResourceTracker::new();
        tracker.acquire(TrackedResource::mount("/r/proc", "mount"));

        let first = tracker.release_all(&exec);
        let second = tracker.release_all(&exec);

        assert_eq!(first.released.len(), 1);
        assert_eq!(second.attempted(), 0);
        assert!(tracker.is_empty());
        assert_eq!(exec.commands_for("umount").len(), 1);
    }

    #[test]
    fn test_not_mounted_counts_as_released() {
        let exec = FakeExecutor::new();
        exec.fail_matching("umount /r/tmp", "umount: /r/tmp: not mounted.");

        let mut tracker = ResourceTracker::new();
        tracker.acquire(TrackedResource::mount("/r/tmp", "mount"));
        let report = tracker.release_all(&exec);

        assert!(report.is_clean());
        assert_eq!(exec.commands_for("umount").len(), 1);
    }

    #[test]
    fn test_release_runs_after_interrupt() {
        let temp = TempDir::new().unwrap();
        let point = temp.path().join("proc");
        fs::create_dir_all(&point).unwrap();
        let cancel = crate::interrupt::CancelToken::new();
        cancel.cancel();
        let exec = crate::executor::HostExecutor::new(cancel);

        let mut tracker = ResourceTracker::new();
        tracker.acquire(TrackedResource::mount(&point, "mount"));
        let report = tracker.release_all(&exec);

        assert_eq!(report.attempted(), 1);
        assert!(
            report
                .failures
                .iter()
                .all(|failure| !failure.reason.contains("interrupted")),
            "{:?}",
            report.failures
        );
    }

    #[test]
    fn test_release_operations_ignore_cancellation() {
        let exec = FakeExecutor::new();
        let mut tracker = ResourceTracker::new();
        tracker.acquire(TrackedResource::mount("/r/proc", "mount"));
        tracker.release_all(&exec);

        let ops = exec.operations();
        assert_eq!(ops.len(), 1);
        assert!(!ops[0].cancellable);
        assert_eq!(ops[0].timeout, Some(RELEASE_TIMEOUT));
    }

    #[test]
    fn test_directory_release_removes_tree() {
        let temp = TempDir::new().unwrap();
        let scratch = temp.path().join("staging");
        fs::create_dir_all(scratch.join("live")).unwrap();
        fs::write(scratch.join("live/file"), "x").unwrap();

        let mut tracker = ResourceTracker::new();
        let first = tracker.acquire(TrackedResource::directory(&scratch, "assemble"));
        let second = tracker.acquire(TrackedResource::directory(scratch.join("live"), "assemble"));
        assert_ne!(first, second);
        assert_eq!(tracker.live()[0].kind, ResourceKind::Directory);

        let report = tracker.release_all(&FakeExecutor::new());
        assert!(report.is_clean());
        assert!(!scratch.exists());
    }

    #[test]
    fn test_process_release_kills_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();

        let mut tracker = ResourceTracker::new();
        tracker.acquire(TrackedResource::process(child.id(), "verify"));
        let report = tracker.release_all(&FakeExecutor::new());

        assert!(report.is_clean());
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}

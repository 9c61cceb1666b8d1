//! Mount: kernel virtual filesystems inside the target root.
//!
//! Each mount is registered with the tracker the moment it succeeds, so a
//! failure part-way through still leaves the earlier mounts queued for
//! release.

use anyhow::{Context, Result};
use std::fs;

use crate::build::context::BuildContext;
use crate::build::stage::{BuildState, Stage};
use crate::executor::{ensure_within_root, resolve_in_root, Operation};

pub const NAME: &str = "mount";

/// One virtual filesystem: mount point relative to the root, and the
/// `mount` arguments that precede it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualMount {
    pub target: &'static str,
    pub args: &'static [&'static str],
}

/// Acquired in this order, released in the reverse.
pub const VIRTUAL_MOUNTS: &[VirtualMount] = &[
    VirtualMount {
        target: "proc",
        args: &["-t", "proc", "proc"],
    },
    VirtualMount {
        target: "sys",
        args: &["-t", "sysfs", "sysfs"],
    },
    VirtualMount {
        target: "dev",
        args: &["--bind", "/dev"],
    },
    VirtualMount {
        target: "dev/pts",
        args: &["--bind", "/dev/pts"],
    },
    VirtualMount {
        target: "tmp",
        args: &["-t", "tmpfs", "tmpfs"],
    },
];

/// Mounts do not survive a run, so this stage is never skipped on resume.
pub fn stage() -> Stage {
    Stage::new(NAME, BuildState::Mounted, run).always_run()
}

fn run(ctx: &mut BuildContext) -> Result<()> {
    let root = ctx.target_root().to_path_buf();
    let real_root = fs::canonicalize(&root)
        .with_context(|| format!("Failed to resolve target root {}", root.display()))?;
    for mount in VIRTUAL_MOUNTS {
        let point = resolve_in_root(&root, mount.target)?;
        fs::create_dir_all(&point)
            .with_context(|| format!("Failed to create mount point {}", point.display()))?;
        // A symlinked mount point inside a reused root could point at the host.
        let real_point = fs::canonicalize(&point)
            .with_context(|| format!("Failed to resolve mount point {}", point.display()))?;
        ensure_within_root(&real_root, &real_point)?;

        let op = Operation::new("mount")
            .args(mount.args.iter().copied())
            .arg_path(&point);
        ctx.exec(&op)
            .with_context(|| format!("Failed to mount {}", point.display()))?;
        ctx.track_mount(point);
    }
    Ok(())
}

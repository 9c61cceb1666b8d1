//! Path confinement for operations against the target root.
//!
//! Anything that names a path inside the image being built goes through
//! [`resolve_in_root`] first, so a crafted input such as `../../etc` can
//! never make a stage touch the host.

use std::path::{Component, Path, PathBuf};

use crate::error::PreconditionError;

/// Join a relative path onto `root`, rejecting absolute paths and traversal.
///
/// A leading `/` is tolerated and stripped, since inputs commonly spell
/// target paths the way they appear inside the installed system
/// (`/etc/hostname`).
pub fn resolve_in_root(root: &Path, relative: &str) -> Result<PathBuf, PreconditionError> {
    let trimmed = relative.trim_start_matches('/');
    let escapes = || PreconditionError::PathEscapesRoot {
        root: root.to_path_buf(),
        path: relative.to_string(),
    };

    if trimmed.is_empty() {
        return Err(escapes());
    }

    let candidate = Path::new(trimmed);
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escapes())
            }
        }
    }

    Ok(root.join(candidate))
}

/// Require that an already-built path lies lexically under `root`.
pub fn ensure_within_root(root: &Path, path: &Path) -> Result<(), PreconditionError> {
    let inside = path.starts_with(root)
        && !path
            .components()
            .any(|component| matches!(component, Component::ParentDir));
    if inside {
        Ok(())
    } else {
        Err(PreconditionError::PathEscapesRoot {
            root: root.to_path_buf(),
            path: path.display().to_string(),
        })
    }
}

//! Mount and unmount primitives.
//!
//! All mounts go through the `mount(8)` utility rather than the raw
//! syscall: loop-mounting the source image needs the utility's loop
//! device handling anyway, and teardown relies on `umount -R`.

use std::path::{Path, PathBuf};
use std::process::Command;

use isoforge_common::{IsoforgeError, IsoforgeResult};

/// One live OS mount: the source device (or filesystem name) and the
/// mountpoint it is attached to. Immutable once created.
#[derive(Debug, Clone)]
pub struct MountHandle {
    source: PathBuf,
    mountpoint: PathBuf,
}

impl MountHandle {
    pub(crate) fn new(source: impl Into<PathBuf>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            mountpoint: mountpoint.into(),
        }
    }

    /// The device or filesystem name this mount was created from.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Where the mount is attached.
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

/// Mount a filesystem onto `target`.
pub(crate) fn mount_cmd(
    fstype: Option<&str>,
    source: &Path,
    options: Option<&str>,
    target: &Path,
) -> IsoforgeResult<()> {
    tracing::debug!(
        ?fstype,
        source = %source.display(),
        ?options,
        target = %target.display(),
        "Mounting filesystem"
    );

    let mut cmd = Command::new("mount");
    if let Some(fstype) = fstype {
        cmd.args(["-t", fstype]);
    }
    cmd.arg(source);
    if let Some(options) = options {
        cmd.args(["-o", options]);
    }
    cmd.arg(target);

    let status = cmd.status().map_err(|e| IsoforgeError::Mount {
        operation: format!("failed to execute mount: {}", e),
    })?;

    if !status.success() {
        return Err(IsoforgeError::Mount {
            operation: format!(
                "mount of {} on {} failed with status: {}",
                source.display(),
                target.display(),
                status
            ),
        });
    }

    Ok(())
}

/// Unmount the filesystem attached at `target`.
pub(crate) fn unmount_cmd(target: &Path) -> IsoforgeResult<()> {
    tracing::debug!(target = %target.display(), "Unmounting filesystem");

    let status = Command::new("umount")
        .arg(target)
        .status()
        .map_err(|e| IsoforgeError::Mount {
            operation: format!("failed to execute umount: {}", e),
        })?;

    if !status.success() {
        return Err(IsoforgeError::Mount {
            operation: format!("umount of {} failed with status: {}", target.display(), status),
        });
    }

    Ok(())
}

/// Recursively unmount `target` and everything still mounted beneath it.
///
/// The mount is made recursively private first so the detach does not
/// propagate outside the scratch tree.
pub(crate) fn unmount_recursive(target: &Path) -> IsoforgeResult<()> {
    tracing::debug!(target = %target.display(), "Recursively unmounting");

    let status = Command::new("mount")
        .args(["--make-rprivate"])
        .arg(target)
        .status()
        .map_err(|e| IsoforgeError::Mount {
            operation: format!("failed to execute mount --make-rprivate: {}", e),
        })?;

    if !status.success() {
        return Err(IsoforgeError::Mount {
            operation: format!(
                "mount --make-rprivate {} failed with status: {}",
                target.display(),
                status
            ),
        });
    }

    let status = Command::new("umount")
        .arg("-R")
        .arg(target)
        .status()
        .map_err(|e| IsoforgeError::Mount {
            operation: format!("failed to execute umount -R: {}", e),
        })?;

    if !status.success() {
        return Err(IsoforgeError::Mount {
            operation: format!(
                "umount -R of {} failed with status: {}",
                target.display(),
                status
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_exposes_source_and_mountpoint() {
        let handle = MountHandle::new("/dev/loop3", "/mnt/target");
        assert_eq!(handle.source(), Path::new("/dev/loop3"));
        assert_eq!(handle.mountpoint(), Path::new("/mnt/target"));
    }
}

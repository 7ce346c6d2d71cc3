//! Volume link management.
//!
//! Containers reference volumes as bind-mount links under their root. The
//! storage backends live outside the container engine; here the daemon only
//! mounts, unmounts and garbage-collects link targets.

use std::path::{Path, PathBuf};

use arbor_common::{Error, ErrorKind, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::container::ContainerData;

/// Bind-mounts a volume source onto a link target.
///
/// # Errors
///
/// Returns an error if the target cannot be created or the mount fails.
pub fn mount_link(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    std::fs::create_dir_all(target)
        .map_err(|e| Error::system("mkdir", &e).context(target.display()))?;

    let mut flags = MsFlags::MS_BIND | MsFlags::MS_NODEV;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    mount(Some(source), target, None::<&str>, flags, None::<&str>)
        .map_err(|e| crate::sys_err("mount", e).context(target.display()))?;
    tracing::debug!(source = %source.display(), target = %target.display(), "volume link mounted");
    Ok(())
}

/// Unmounts a volume link; lazily, so busy trees cannot wedge a stop.
///
/// # Errors
///
/// Returns an error if the umount fails for a reason other than the target
/// not being mounted.
pub fn umount_link(target: &Path) -> Result<()> {
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => {
            tracing::debug!(target = %target.display(), "volume link unmounted");
            Ok(())
        }
        Err(nix::errno::Errno::EINVAL | nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(crate::sys_err("umount2", e).context(target.display())),
    }
}

/// Unlinks every volume of a container, returning the orphaned targets for
/// deferred destruction.
#[must_use]
pub fn unlink_all(data: &mut ContainerData) -> Vec<PathBuf> {
    let links = std::mem::take(&mut data.volumes);
    for target in &links {
        if let Err(e) = umount_link(target) {
            tracing::warn!(target = %target.display(), error = %e, "cannot unmount volume link");
        }
    }
    links
}

/// Removes orphaned link targets after their container is gone. Best effort;
/// the container no longer exists to report to.
pub fn destroy_unlinked(links: Vec<PathBuf>) {
    for target in links {
        if let Err(e) = std::fs::remove_dir(&target) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(target = %target.display(), error = %e, "cannot remove volume link target");
            }
        }
    }
}

/// Verifies that every volume a container requires is linked.
///
/// # Errors
///
/// Returns `ResourceNotAvailable` naming the first missing link.
pub fn check_required(data: &ContainerData) -> Result<()> {
    for target in &data.volumes {
        if !target.exists() {
            return Err(Error::new(
                ErrorKind::ResourceNotAvailable,
                format!("required volume link missing: {}", target.display()),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umount_of_unmounted_path_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        umount_link(dir.path()).expect("detached umount of plain dir");
    }

    #[test]
    fn destroy_unlinked_removes_empty_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("link");
        std::fs::create_dir(&target).expect("mkdir");
        destroy_unlinked(vec![target.clone()]);
        assert!(!target.exists());
    }
}

//! Shared set-up and tear-down steps for volume plugins

use crate::error::{Error, Result};
use crate::mount::Mounter;
use std::path::Path;
use tracing::{debug, error, warn};

/// Mode of directories created for volume mount points
pub const MOUNT_DIR_MODE: u32 = 0o750;

/// Whether `dir` is already a mount point; a missing directory is not
pub async fn is_mounted(mounter: &dyn Mounter, dir: &Path) -> Result<bool> {
    match mounter.is_likely_not_mount_point(dir).await {
        Ok(not_mnt) => Ok(!not_mnt),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => {
            error!("Cannot validate mount point {:?}: {}", dir, e);
            Err(e)
        }
    }
}

/// Create `dir` and its parents with the mount point mode
pub fn make_mount_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(MOUNT_DIR_MODE)
        .create(dir)
        .map_err(|e| {
            error!("mkdir failed on {:?}: {}", dir, e);
            e.into()
        })
}

/// Undo a half-made mount at `dir` after a failed mount
///
/// Unmounts when something got mounted, checks the unmount took, and removes
/// the directory. Cleanup problems are logged; the caller returns its original
/// mount error either way.
pub async fn cleanup_failed_mount(mounter: &dyn Mounter, dir: &Path) {
    let not_mnt = match mounter.is_likely_not_mount_point(dir).await {
        Ok(v) => v,
        Err(e) => {
            error!("IsLikelyNotMountPoint check failed for {:?}: {}", dir, e);
            return;
        }
    };
    if !not_mnt {
        if let Err(e) = mounter.unmount(dir).await {
            error!("Failed to unmount {:?}: {}", dir, e);
            return;
        }
        match mounter.is_likely_not_mount_point(dir).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "{:?} is still mounted, despite call to unmount; will try again next sync",
                    dir
                );
                return;
            }
            Err(e) => {
                error!("IsLikelyNotMountPoint check failed for {:?}: {}", dir, e);
                return;
            }
        }
    }
    if let Err(e) = std::fs::remove_dir(dir) {
        warn!("Failed to remove {:?} after failed mount: {}", dir, e);
    }
}

/// Unmount `dir` if it is a mount point and remove the directory
///
/// A missing directory is already torn down.
pub async fn unmount_mount_point(mounter: &dyn Mounter, dir: &Path) -> Result<()> {
    if !dir.exists() {
        warn!("Warning: Unmount skipped because path does not exist: {:?}", dir);
        return Ok(());
    }

    let not_mnt = mounter.is_likely_not_mount_point(dir).await?;
    if not_mnt {
        debug!("{:?} is not a mount point, deleting", dir);
        std::fs::remove_dir(dir)?;
        return Ok(());
    }

    mounter.unmount(dir).await?;
    if !mounter.is_likely_not_mount_point(dir).await? {
        return Err(Error::StillMounted {
            path: dir.display().to_string(),
        });
    }
    debug!("{:?} is unmounted, deleting the directory", dir);
    std::fs::remove_dir(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMounter, MountAction};
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_unmount_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("vol");
        std::fs::create_dir(&target).unwrap();

        let mounter = FakeMounter::new();
        mounter.mount("tmpfs", &target, "tmpfs", &[]).await.unwrap();
        assert!(is_mounted(&mounter, &target).await.unwrap());

        unmount_mount_point(&mounter, &target).await.unwrap();
        assert!(!target.exists());
        assert_matches!(
            mounter.actions().last(),
            Some(MountAction::Unmount { target: t }) if *t == target
        );

        // Already gone
        unmount_mount_point(&mounter, &target).await.unwrap();
    }

    #[tokio::test]
    async fn test_unmount_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("vol");
        std::fs::create_dir(&target).unwrap();

        let mounter = FakeMounter::new();
        unmount_mount_point(&mounter, &target).await.unwrap();
        assert!(!target.exists());
        assert!(mounter.actions().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_failed_mount() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("vol");
        make_mount_dir(&target).unwrap();

        let mounter = FakeMounter::new();
        mounter.mount("srv:/x", &target, "nfs", &[]).await.unwrap();
        cleanup_failed_mount(&mounter, &target).await;

        assert!(!target.exists());
        assert!(!is_mounted(&mounter, &target).await.unwrap());
    }
}

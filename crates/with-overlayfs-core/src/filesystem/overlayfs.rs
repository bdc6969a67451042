//! `OverlayFS` construction and teardown for a single directory.
//!
//! The overlay is first mounted at a private staging mountpoint and only
//! then moved over the original directory, so an observer sees either the
//! original content or the fully assembled overlay, never an empty or
//! half-built mount.

use std::path::{Path, PathBuf};

use with_overlayfs_common::constants::OVERLAY_WORK_SUBDIR;
use with_overlayfs_common::error::{OverlayError, Result};
use with_overlayfs_common::types::{DirectorySpec, MountState};

use super::scratch::ScratchDir;
use crate::privilege::Identity;

/// A copy-on-write layer placed over one directory.
#[derive(Debug)]
pub struct OverlayMount {
    target: PathBuf,
    upper: ScratchDir,
    work: ScratchDir,
    staging: ScratchDir,
    options: String,
    state: MountState,
}

impl OverlayMount {
    /// Builds the overlay for `spec` and moves it over the original path.
    ///
    /// Scratch directories are allocated under `scratch_base` and handed to
    /// `owner` so the unprivileged phase can write through the overlay.
    ///
    /// # Errors
    ///
    /// Returns an error if any allocation, ownership change, mount, or move
    /// fails. Nothing is left mounted on failure.
    pub fn build(spec: &DirectorySpec, owner: Identity, scratch_base: &Path) -> Result<Self> {
        let upper = ScratchDir::create(scratch_base)?;
        let mut work = ScratchDir::create(scratch_base)?;
        let staging = ScratchDir::create(scratch_base)?;

        for dir in [&upper, &work, &staging] {
            dir.chown(owner.uid, owner.gid)?;
        }
        work.register_dir(OVERLAY_WORK_SUBDIR);

        let options = overlay_options(&spec.path, upper.path(), work.path());
        let mut overlay = Self {
            target: spec.path.clone(),
            upper,
            work,
            staging,
            options,
            state: MountState::Mounted,
        };

        mount_overlay(overlay.staging.path(), &overlay.options)?;
        if let Err(e) = move_mount(overlay.staging.path(), &overlay.target) {
            if let Err(detach_err) = detach_overlay(overlay.staging.path()) {
                tracing::warn!(error = %detach_err, "failed to detach staging overlay");
            }
            overlay.state = MountState::Unmounted;
            return Err(e);
        }
        overlay.state = MountState::Moved;

        tracing::info!(
            path = %overlay.target.display(),
            upper = %overlay.upper.path().display(),
            "overlay moved into place"
        );
        Ok(overlay)
    }

    /// Directory the overlay now covers.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Mount options the overlay was created with.
    pub fn options(&self) -> &str {
        &self.options
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> MountState {
        self.state
    }

    /// Writable layer, where substituted files land.
    pub fn upper_mut(&mut self) -> &mut ScratchDir {
        &mut self.upper
    }

    /// Upper, work, and staging directories, in that order.
    pub fn scratch_dirs_mut(&mut self) -> [&mut ScratchDir; 3] {
        [&mut self.upper, &mut self.work, &mut self.staging]
    }

    /// Lazily detaches the overlay from the original path.
    ///
    /// Open descriptors and mappings into the overlay keep working; new
    /// lookups see the original directory again.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Mount`] if the overlay is not in place or
    /// `umount2(2)` fails.
    pub fn detach(&mut self) -> Result<()> {
        if self.state != MountState::Moved {
            return Err(OverlayError::Mount {
                target: self.target.clone(),
                message: format!("cannot detach an overlay that is {}", self.state),
            });
        }
        detach_overlay(&self.target)?;
        self.state = MountState::Unmounted;
        Ok(())
    }

    /// Records a detach that another process performed on this mount.
    pub fn mark_detached(&mut self) {
        if self.state == MountState::Moved {
            self.state = MountState::Unmounted;
        }
    }
}

/// Formats the overlay mount data for a single lower layer.
pub fn overlay_options(lower: &Path, upper: &Path, work: &Path) -> String {
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    )
}

/// Mounts an overlay at `mountpoint` with the given options.
///
/// # Errors
///
/// Returns [`OverlayError::Mount`] if the `mount(2)` syscall fails.
#[cfg(target_os = "linux")]
pub fn mount_overlay(mountpoint: &Path, options: &str) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        Some("overlay"),
        mountpoint,
        Some("overlay"),
        MsFlags::empty(),
        Some(options),
    )
    .map_err(|e| OverlayError::Mount {
        target: mountpoint.to_path_buf(),
        message: format!("overlay mount failed ({options}): {e}"),
    })?;
    tracing::debug!(mountpoint = %mountpoint.display(), options, "overlay mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; `OverlayFS` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(_mountpoint: &Path, _options: &str) -> Result<()> {
    Err(OverlayError::Config {
        message: "Linux required for with-overlayfs".into(),
    })
}

/// Moves the mount at `from` onto `to`, replacing what `to` showed.
///
/// # Errors
///
/// Returns [`OverlayError::Mount`] if the `MS_MOVE` mount fails.
#[cfg(target_os = "linux")]
pub fn move_mount(from: &Path, to: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    mount(
        Some(from),
        to,
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .map_err(|e| OverlayError::Mount {
        target: to.to_path_buf(),
        message: format!("moving {} failed: {e}", from.display()),
    })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; move-mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn move_mount(_from: &Path, _to: &Path) -> Result<()> {
    Err(OverlayError::Config {
        message: "Linux required for with-overlayfs".into(),
    })
}

/// Lazily unmounts whatever is mounted at `path` (`MNT_DETACH`).
///
/// # Errors
///
/// Returns [`OverlayError::Mount`] if the unmount syscall fails.
#[cfg(target_os = "linux")]
pub fn detach_overlay(path: &Path) -> Result<()> {
    nix::mount::umount2(path, nix::mount::MntFlags::MNT_DETACH).map_err(|e| {
        OverlayError::Mount {
            target: path.to_path_buf(),
            message: format!("lazy unmount failed: {e}"),
        }
    })?;
    tracing::info!(path = %path.display(), "overlay detached");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; unmounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn detach_overlay(_path: &Path) -> Result<()> {
    Err(OverlayError::Config {
        message: "Linux required for with-overlayfs".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_name_all_three_layers() {
        let opts = overlay_options(
            Path::new("/srv/app"),
            Path::new("/tmp/with-overlayfsAAAAAA"),
            Path::new("/tmp/with-overlayfsBBBBBB"),
        );
        assert_eq!(
            opts,
            "lowerdir=/srv/app,upperdir=/tmp/with-overlayfsAAAAAA,workdir=/tmp/with-overlayfsBBBBBB"
        );
    }

    #[test]
    fn detaching_a_missing_mount_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(detach_overlay(tmp.path()).is_err());
    }

    #[test]
    fn building_without_privilege_fails_and_cleans_up() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let scratch = tempfile::tempdir().unwrap();
        let lower = tempfile::tempdir().unwrap();
        let owner = Identity::capture_real().unwrap();
        let spec = DirectorySpec::new(lower.path());

        assert!(OverlayMount::build(&spec, owner, scratch.path()).is_err());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }
}

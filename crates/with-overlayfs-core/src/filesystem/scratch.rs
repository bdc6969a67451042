//! Scoped scratch directories.
//!
//! A [`ScratchDir`] is created with `mkdtemp(3)` and removed, together with
//! everything registered under it, when it is dropped. Some entries the
//! kernel creates (an overlay's `work/work`) are root-owned and mode 000, so
//! once the process has dropped privileges, removal must be handed to a
//! process that kept them: [`ScratchDir::disarm`] turns the drop into a
//! no-op and [`ScratchDir::remove`] is called from there instead.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use with_overlayfs_common::constants::SCRATCH_PREFIX;
use with_overlayfs_common::error::{OverlayError, Result};

/// A uniquely named temporary directory owned by the current scope.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    files_to_unlink: Vec<PathBuf>,
    dirs_to_unlink: Vec<PathBuf>,
    armed: bool,
}

impl ScratchDir {
    /// Creates a new directory `<base>/with-overlayfsXXXXXX`.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Io`] if `mkdtemp(3)` fails.
    pub fn create(base: &Path) -> Result<Self> {
        let template = base.join(format!("{SCRATCH_PREFIX}XXXXXX"));
        let path = nix::unistd::mkdtemp(template.as_path())
            .map_err(|e| OverlayError::io(&template, e.into()))?;
        tracing::debug!(path = %path.display(), "scratch directory created");
        Ok(Self {
            path,
            files_to_unlink: Vec::new(),
            dirs_to_unlink: Vec::new(),
            armed: true,
        })
    }

    /// Hands the directory to `uid`/`gid` without following symlinks.
    ///
    /// The directory is opened with `O_NOFOLLOW | O_DIRECTORY` and changed
    /// through the descriptor, so a name swapped for a symlink after
    /// `mkdtemp` fails instead of redirecting the ownership change.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Io`] if the open or `fchown(2)` fails.
    pub fn chown(&self, uid: Uid, gid: Gid) -> Result<()> {
        let dir = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_DIRECTORY | nix::libc::O_NOFOLLOW)
            .open(&self.path)
            .map_err(|e| OverlayError::io(&self.path, e))?;
        std::os::unix::fs::fchown(&dir, Some(uid.as_raw()), Some(gid.as_raw()))
            .map_err(|e| OverlayError::io(&self.path, e))
    }

    /// Path of the directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers a file, relative to this directory, for removal on drop.
    pub fn register_file(&mut self, relative: impl Into<PathBuf>) {
        self.files_to_unlink.push(relative.into());
    }

    /// Registers a subdirectory, relative to this directory, for removal on drop.
    ///
    /// Subdirectories are removed in reverse registration order, after files.
    pub fn register_dir(&mut self, relative: impl Into<PathBuf>) {
        self.dirs_to_unlink.push(relative.into());
    }

    /// Leaves removal to whoever calls [`ScratchDir::remove`] later.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Whether dropping this value removes the directory.
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Removes registered entries, then the directory itself.
    ///
    /// # Errors
    ///
    /// Returns the error of the final recursive removal; a directory that is
    /// already gone is not an error.
    pub fn remove(&self) -> std::io::Result<()> {
        for file in &self.files_to_unlink {
            let _ = std::fs::remove_file(self.path.join(file));
        }
        for dir in self.dirs_to_unlink.iter().rev() {
            let _ = std::fs::remove_dir(self.path.join(dir));
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "scratch directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.remove() {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "scratch directory left behind"
            );
        }
    }
}

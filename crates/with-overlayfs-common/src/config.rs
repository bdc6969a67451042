//! Runtime configuration for a single invocation.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, Result};

/// Settings that shape how the overlays are built and torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Base directory for upper/work/mountpoint scratch directories.
    pub scratch_dir: PathBuf,
    /// Startup hook library preloaded into the target for deferred unmount.
    pub hook_path: PathBuf,
    /// Whether to detach every overlay once the target has loaded.
    pub discard_after_exec: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from(crate::constants::DEFAULT_SCRATCH_DIR),
            hook_path: PathBuf::from(crate::constants::DEFAULT_HOOK_PATH),
            discard_after_exec: false,
        }
    }
}

impl RunConfig {
    /// Checks the configuration before any privileged step runs.
    ///
    /// The hook is only required when deferred unmount is requested.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Config`] if the scratch directory is missing
    /// or unsafe, or the hook library cannot be found.
    pub fn validate(&self) -> Result<()> {
        check_scratch_base(&self.scratch_dir)?;
        if self.discard_after_exec {
            if !self.hook_path.is_absolute() {
                return Err(OverlayError::Config {
                    message: format!("hook path {} must be absolute", self.hook_path.display()),
                });
            }
            if !self.hook_path.is_file() {
                return Err(OverlayError::Config {
                    message: format!("hook library {} not found", self.hook_path.display()),
                });
            }
        }
        Ok(())
    }
}

/// Checks that the invoker cannot rename entries root creates in `base`.
///
/// The base must be a root-owned directory that is either sticky (like
/// `/tmp`) or not writable by group and others.
fn check_scratch_base(base: &Path) -> Result<()> {
    let unsafe_base = |reason: &str| OverlayError::Config {
        message: format!("scratch directory {} {reason}", base.display()),
    };

    let metadata = std::fs::metadata(base).map_err(|_| unsafe_base("does not exist"))?;
    if !metadata.is_dir() {
        return Err(unsafe_base("is not a directory"));
    }
    if metadata.uid() != 0 {
        return Err(unsafe_base("must be owned by root"));
    }
    let mode = metadata.mode();
    if mode & SCRATCH_STICKY == 0 && mode & SCRATCH_SHARED_WRITE != 0 {
        return Err(unsafe_base(
            "is writable by other users and must have the sticky bit",
        ));
    }
    Ok(())
}

const SCRATCH_STICKY: u32 = 0o1000;
const SCRATCH_SHARED_WRITE: u32 = 0o022;

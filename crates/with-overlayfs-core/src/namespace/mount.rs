//! Mount namespace isolation.
//!
//! Gives the supervisor's process tree its own mount table and marks every
//! mount in it private, so moving an overlay over a directory never
//! propagates to the host.

use with_overlayfs_common::error::{OverlayError, Result};

/// Unshares the mount namespace and makes `/` private, recursively.
///
/// Must run before any move-mount.
///
/// # Errors
///
/// Returns [`OverlayError::Namespace`] if `unshare(CLONE_NEWNS)` or the
/// propagation change fails.
#[cfg(target_os = "linux")]
pub fn create_private_mount_namespace() -> Result<()> {
    use nix::mount::{MsFlags, mount};
    use nix::sched::{CloneFlags, unshare};

    unshare(CloneFlags::CLONE_NEWNS).map_err(|e| OverlayError::Namespace {
        message: format!("unshare(CLONE_NEWNS) failed: {e}"),
    })?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| OverlayError::Namespace {
        message: format!("making / private failed: {e}"),
    })?;
    tracing::debug!("private mount namespace created");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mount namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn create_private_mount_namespace() -> Result<()> {
    Err(OverlayError::Config {
        message: "Linux required for with-overlayfs".into(),
    })
}

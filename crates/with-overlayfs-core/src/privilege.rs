//! Privilege transition for the setuid supervisor.
//!
//! The real user and group ids are the only trustworthy record of who
//! invoked a setuid binary. They are captured before any namespace or mount
//! work and restored, irrevocably, before any untrusted code runs.

use nix::unistd::{Gid, Uid};
use with_overlayfs_common::error::{OverlayError, Result};

/// Real identity of the invoking user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Real user id.
    pub uid: Uid,
    /// Real group id.
    pub gid: Gid,
}

impl Identity {
    /// Captures the real uid/gid of the calling process.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Privilege`] if `getresuid(2)` or
    /// `getresgid(2)` fails.
    #[cfg(target_os = "linux")]
    pub fn capture_real() -> Result<Self> {
        let gids = nix::unistd::getresgid().map_err(|e| OverlayError::Privilege {
            message: format!("getresgid failed: {e}"),
        })?;
        let uids = nix::unistd::getresuid().map_err(|e| OverlayError::Privilege {
            message: format!("getresuid failed: {e}"),
        })?;
        tracing::debug!(
            ruid = uids.real.as_raw(),
            euid = uids.effective.as_raw(),
            rgid = gids.real.as_raw(),
            "captured invoking identity"
        );
        Ok(Self {
            uid: uids.real,
            gid: gids.real,
        })
    }

    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error.
    #[cfg(not(target_os = "linux"))]
    pub fn capture_real() -> Result<Self> {
        Err(OverlayError::Config {
            message: "Linux required for with-overlayfs".into(),
        })
    }
}

/// Ensures the process can perform the privileged setup.
///
/// # Errors
///
/// Returns [`OverlayError::Privilege`] unless the effective uid is root,
/// which is the case when the binary is installed setuid root.
pub fn require_effective_root() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(OverlayError::Privilege {
            message: "effective uid is not root; install the binary setuid root".into(),
        })
    }
}

/// Permanently drops to `identity`, group first.
///
/// Real, effective, and saved ids are all replaced so the privilege cannot
/// be regained.
///
/// # Errors
///
/// Returns [`OverlayError::Privilege`] if either call fails or the
/// resulting credentials do not match.
#[cfg(target_os = "linux")]
pub fn drop_to(identity: Identity) -> Result<()> {
    use nix::unistd::{getresgid, getresuid, setresgid, setresuid};

    let Identity { uid, gid } = identity;
    setresgid(gid, gid, gid).map_err(|e| OverlayError::Privilege {
        message: format!("setresgid({gid}) failed: {e}"),
    })?;
    setresuid(uid, uid, uid).map_err(|e| OverlayError::Privilege {
        message: format!("setresuid({uid}) failed: {e}"),
    })?;

    let uids = getresuid().map_err(|e| OverlayError::Privilege {
        message: format!("getresuid failed: {e}"),
    })?;
    let gids = getresgid().map_err(|e| OverlayError::Privilege {
        message: format!("getresgid failed: {e}"),
    })?;
    let all_uids = [uids.real, uids.effective, uids.saved];
    let all_gids = [gids.real, gids.effective, gids.saved];
    if all_uids.iter().any(|u| *u != uid) || all_gids.iter().any(|g| *g != gid) {
        return Err(OverlayError::Privilege {
            message: "credentials still differ from the invoking user after drop".into(),
        });
    }

    tracing::info!(uid = uid.as_raw(), gid = gid.as_raw(), "dropped privileges");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error.
#[cfg(not(target_os = "linux"))]
pub fn drop_to(_identity: Identity) -> Result<()> {
    Err(OverlayError::Config {
        message: "Linux required for with-overlayfs".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captured_identity_matches_real_ids() {
        let identity = Identity::capture_real().unwrap();
        assert_eq!(identity.uid, nix::unistd::getuid());
        assert_eq!(identity.gid, nix::unistd::getgid());
    }

    #[test]
    fn dropping_to_current_identity_is_a_no_op() {
        let identity = Identity::capture_real().unwrap();
        if identity.uid != nix::unistd::geteuid() || identity.gid != nix::unistd::getegid() {
            return;
        }
        drop_to(identity).unwrap();
        assert_eq!(nix::unistd::geteuid(), identity.uid);
    }

    #[test]
    fn root_requirement_follows_effective_uid() {
        let result = require_effective_root();
        assert_eq!(result.is_ok(), nix::unistd::geteuid().is_root());
    }
}

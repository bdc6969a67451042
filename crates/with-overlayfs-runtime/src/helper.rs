//! The forked unmount helper.
//!
//! Forked while the supervisor is still privileged, the helper keeps the
//! helper endpoint of the handshake channel, waits for the hook's "go",
//! lazily detaches every overlay in the order given, and answers "done".

use std::path::PathBuf;

use nix::unistd::{ForkResult, Pid, fork};
use with_overlayfs_common::constants::EXIT_HELPER_FAILURE;
use with_overlayfs_common::error::{OverlayError, Result};
use with_overlayfs_core::filesystem::overlayfs::detach_overlay;

use crate::handshake::{HandshakeChannel, HelperEndpoint, HookEndpoint};
use crate::process::{self, ExitOutcome};

/// Handle to a running unmount helper.
#[derive(Debug)]
pub struct UnmountHelper {
    pid: Pid,
}

impl UnmountHelper {
    /// Forks the helper for `targets` and returns the hook endpoint.
    ///
    /// The helper closes its copy of the hook endpoint and the supervisor
    /// closes its copy of the helper endpoint, so each side sees
    /// end-of-stream once the other side's last copy is gone.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Process`] if `fork(2)` fails.
    pub fn spawn(channel: HandshakeChannel, targets: Vec<PathBuf>) -> Result<(Self, HookEndpoint)> {
        let (helper, hook) = channel.split();

        // SAFETY: the supervisor is single-threaded; the child only runs the
        // handshake and leaves through `_exit`, never returning into the
        // caller's frames or running their destructors.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(hook);
                let code = run(helper, &targets);
                // SAFETY: `_exit` skips destructors of the supervisor's state
                // copied into this process, such as its scratch directories.
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(helper);
                tracing::debug!(pid = child.as_raw(), "unmount helper forked");
                Ok((Self { pid: child }, hook))
            }
            Err(e) => Err(OverlayError::Process {
                message: format!("fork of unmount helper failed: {e}"),
            }),
        }
    }

    /// Process id of the helper.
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Waits for the helper and reports whether every overlay was detached.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Process`] if `waitpid(2)` fails.
    pub fn wait(self) -> Result<bool> {
        let outcome = process::wait_for(self.pid)?;
        let detached = outcome == ExitOutcome::Exited(0);
        if !detached {
            tracing::warn!(
                pid = self.pid.as_raw(),
                outcome = %outcome,
                "unmount helper did not complete; overlays were not discarded"
            );
        }
        Ok(detached)
    }
}

fn run(mut endpoint: HelperEndpoint, targets: &[PathBuf]) -> i32 {
    match endpoint.serve(|| detach_all(targets)) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(error = %e, "unmount helper failed");
            EXIT_HELPER_FAILURE
        }
    }
}

/// Detaches every target, in order, reporting the first failure.
///
/// Overlays are independent, so a failure does not stop the remaining ones.
///
/// # Errors
///
/// Returns the first detach error encountered.
pub fn detach_all(targets: &[PathBuf]) -> Result<()> {
    let mut first_error = None;
    for target in targets {
        if let Err(e) = detach_overlay(target) {
            tracing::warn!(path = %target.display(), error = %e, "lazy unmount failed");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

//! Privileged removal of scratch directories.
//!
//! The supervisor gives up root before it writes replacements and launches
//! the target, but the overlay work directories it leaves behind can only be
//! removed by root. A [`ScratchReaper`] is forked while still privileged: it
//! blocks until the supervisor's end of a pipe is closed, on any exit path,
//! then removes every scratch directory it was given.

use std::fs::File;
use std::io::Read;
use std::os::fd::OwnedFd;

use nix::fcntl::OFlag;
use nix::unistd::{ForkResult, Pid, fork, pipe2};
use with_overlayfs_common::constants::EXIT_HELPER_FAILURE;
use with_overlayfs_common::error::{OverlayError, Result};
use with_overlayfs_core::filesystem::scratch::ScratchDir;

use crate::process::{self, ExitOutcome};

/// Handle to the forked cleanup process.
///
/// Dropping the handle releases the reaper and waits for it.
#[derive(Debug)]
pub struct ScratchReaper {
    pid: Pid,
    release: Option<OwnedFd>,
}

impl ScratchReaper {
    /// Forks a reaper for `dirs` and disarms them in this process.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Process`] if the pipe or `fork(2)` fails.
    /// The directories stay armed in that case.
    pub fn spawn(dirs: Vec<&mut ScratchDir>) -> Result<Self> {
        let (wait_end, release) = pipe2(OFlag::O_CLOEXEC).map_err(|e| OverlayError::Process {
            message: format!("pipe for scratch cleanup failed: {e}"),
        })?;

        // SAFETY: the supervisor is single-threaded; the child only blocks on
        // the pipe, removes directories, and leaves through `_exit`.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(release);
                let code = reap(wait_end, &dirs);
                // SAFETY: skips destructors of the supervisor state copied here.
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(wait_end);
                for dir in dirs {
                    dir.disarm();
                }
                tracing::debug!(pid = child.as_raw(), "scratch reaper forked");
                Ok(Self {
                    pid: child,
                    release: Some(release),
                })
            }
            Err(e) => Err(OverlayError::Process {
                message: format!("fork of scratch reaper failed: {e}"),
            }),
        }
    }

    /// Process id of the reaper.
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Lets the reaper run and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Process`] if `waitpid(2)` fails.
    pub fn finish(mut self) -> Result<bool> {
        self.release_and_wait()
    }

    fn release_and_wait(&mut self) -> Result<bool> {
        if self.release.take().is_none() {
            return Ok(true);
        }
        let outcome = process::wait_for(self.pid)?;
        let removed = outcome == ExitOutcome::Exited(0);
        if !removed {
            tracing::warn!(
                pid = self.pid.as_raw(),
                outcome = %outcome,
                "scratch reaper could not remove every directory"
            );
        }
        Ok(removed)
    }
}

impl Drop for ScratchReaper {
    fn drop(&mut self) {
        if let Err(e) = self.release_and_wait() {
            tracing::warn!(error = %e, "waiting for scratch reaper failed");
        }
    }
}

fn reap(wait_end: OwnedFd, dirs: &[&mut ScratchDir]) -> i32 {
    let mut wait_end = File::from(wait_end);
    let mut byte = [0u8; 1];
    loop {
        match wait_end.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }

    let mut code = 0;
    for dir in dirs {
        if let Err(e) = dir.remove() {
            tracing::warn!(path = %dir.path().display(), error = %e, "scratch directory left behind");
            code = EXIT_HELPER_FAILURE;
        }
    }
    code
}

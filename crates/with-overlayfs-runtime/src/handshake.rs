//! The deferred-unmount handshake channel.
//!
//! A connected stream socket pair links the unmount helper to the startup
//! hook running inside the target. The hook writes one "go" byte once the
//! new program image is resident; the helper detaches every overlay and
//! answers with one "done" byte. Stream sockets are used so that closing the
//! last copy of either endpoint shows up as end-of-stream on the other.

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use with_overlayfs_common::constants::{HANDSHAKE_DONE, HANDSHAKE_GO};
use with_overlayfs_common::error::{OverlayError, Result};

/// Both endpoints of a freshly created channel.
///
/// Endpoints are close-on-exec; only the hook endpoint is made inheritable,
/// and only inside the child that execs the target.
#[derive(Debug)]
pub struct HandshakeChannel {
    helper: HelperEndpoint,
    hook: HookEndpoint,
}

impl HandshakeChannel {
    /// Creates a connected endpoint pair.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Handshake`] if `socketpair(2)` fails.
    pub fn new() -> Result<Self> {
        let (helper, hook) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| OverlayError::Handshake {
            message: format!("socketpair failed: {e}"),
        })?;
        tracing::debug!(
            helper_fd = helper.as_raw_fd(),
            hook_fd = hook.as_raw_fd(),
            "handshake channel created"
        );
        Ok(Self {
            helper: HelperEndpoint(UnixStream::from(helper)),
            hook: HookEndpoint(UnixStream::from(hook)),
        })
    }

    /// Separates the channel into the helper's and the hook's endpoints.
    pub fn split(self) -> (HelperEndpoint, HookEndpoint) {
        (self.helper, self.hook)
    }
}

/// The endpoint kept by the unmount helper.
#[derive(Debug)]
pub struct HelperEndpoint(UnixStream);

impl HelperEndpoint {
    /// Blocks for "go", runs `detach`, then answers "done".
    ///
    /// "done" is sent even when `detach` fails so the target is never held
    /// back; the failure is still returned.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Handshake`] if every hook endpoint was closed
    /// before "go" arrived (the target never loaded the hook), or the error
    /// returned by `detach`.
    pub fn serve(&mut self, detach: impl FnOnce() -> Result<()>) -> Result<()> {
        serve(&mut self.0, detach)
    }
}

/// The endpoint whose descriptor number is handed to the target.
#[derive(Debug)]
pub struct HookEndpoint(UnixStream);

impl HookEndpoint {
    /// Raw descriptor number, as published to the target's environment.
    pub fn raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    /// Clears close-on-exec so the descriptor survives image replacement.
    ///
    /// Only called in the child about to exec the target.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Handshake`] if `fcntl(2)` fails.
    pub fn inherit_across_exec(&self) -> Result<()> {
        use nix::fcntl::{FcntlArg, FdFlag, fcntl};

        let _ = fcntl(self.0.as_fd(), FcntlArg::F_SETFD(FdFlag::empty())).map_err(|e| {
            OverlayError::Handshake {
                message: format!("clearing FD_CLOEXEC failed: {e}"),
            }
        })?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn into_stream(self) -> UnixStream {
        self.0
    }
}

impl AsFd for HookEndpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Helper side of the protocol over any byte stream.
///
/// # Errors
///
/// See [`HelperEndpoint::serve`].
pub fn serve<S: Read + Write>(stream: &mut S, detach: impl FnOnce() -> Result<()>) -> Result<()> {
    let mut byte = [0u8; 1];
    let read = stream.read(&mut byte).map_err(|e| OverlayError::Handshake {
        message: format!("waiting for go failed: {e}"),
    })?;
    if read == 0 {
        return Err(OverlayError::Handshake {
            message: "hook endpoint closed before go; target did not load the hook".into(),
        });
    }
    if byte[0] != HANDSHAKE_GO {
        return Err(OverlayError::Handshake {
            message: format!("unexpected handshake byte {:#04x}", byte[0]),
        });
    }
    tracing::debug!("go received");

    let detached = detach();

    stream
        .write_all(&[HANDSHAKE_DONE])
        .map_err(|e| OverlayError::Handshake {
            message: format!("sending done failed: {e}"),
        })?;
    tracing::debug!("done sent");
    detached
}

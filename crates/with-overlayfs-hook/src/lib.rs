//! Startup hook for `with-overlayfs --discard-after-exec`.
//!
//! Built as a shared library and preloaded into the target program through
//! `LD_PRELOAD`. Its constructor runs after the dynamic loader has mapped
//! the program and its libraries, but before any of the program's own code.
//! At that point the overlays are no longer needed, so the hook asks the
//! unmount helper to detach them and waits until it has.
//!
//! The constructor is inert unless `WITH_OVERLAYFS_AFTER_LOAD_FD` is set.
//! It never logs: the target's stdout and stderr belong to the target.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

use with_overlayfs_common::constants::{AFTER_LOAD_ENV, HANDSHAKE_GO, PRELOAD_ENV};

#[used]
#[unsafe(link_section = ".init_array")]
static AFTER_LOAD: extern "C" fn() = after_load;

extern "C" fn after_load() {
    let Some(fd) = take_descriptor() else {
        return;
    };
    // SAFETY: the descriptor was checked to be open and was created by the
    // supervisor for this handshake only; nothing else in the new image
    // refers to it, so taking ownership here is sound.
    let mut stream = unsafe { UnixStream::from_raw_fd(fd) };
    let _ = signal_and_wait(&mut stream);
}

/// Reads and clears the handshake variables.
///
/// Both variables are removed even when the descriptor is unusable, so the
/// program and its children start with a clean environment.
fn take_descriptor() -> Option<RawFd> {
    let value = std::env::var_os(AFTER_LOAD_ENV)?;
    // SAFETY: constructors run before `main`, while the process is still
    // single-threaded, so no other thread can be reading the environment.
    unsafe {
        std::env::remove_var(AFTER_LOAD_ENV);
        std::env::remove_var(PRELOAD_ENV);
    }
    let fd = parse_descriptor(value.to_str()?)?;
    // SAFETY: F_GETFD only inspects the descriptor table.
    let open = unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0;
    open.then_some(fd)
}

/// Parses a descriptor number published by the supervisor.
pub fn parse_descriptor(value: &str) -> Option<RawFd> {
    value.trim().parse::<RawFd>().ok().filter(|fd| *fd >= 0)
}

/// Hook side of the handshake: send "go", then block until the helper
/// answers or goes away.
///
/// End-of-stream counts as completion: a helper that died has nothing left
/// to wait for.
///
/// # Errors
///
/// Returns the underlying I/O error if writing or reading fails.
pub fn signal_and_wait<S: Read + Write>(stream: &mut S) -> io::Result<()> {
    stream.write_all(&[HANDSHAKE_GO])?;
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

//! Supervisor side of `with-overlayfs`.
//!
//! Sequences namespace creation, overlay construction, privilege drop, file
//! substitution, and the target's execution, and runs the deferred-unmount
//! handshake with the startup hook when requested.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cleanup;
pub mod engine;
pub mod handshake;
pub mod helper;
pub mod process;

// Forked children inherit every descriptor open in the test process,
// including other tests' channel and pipe ends; concurrent forks could then
// keep each other from seeing end-of-stream.
#[cfg(test)]
static FORK_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

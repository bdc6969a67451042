//! Linux namespace management.
//!
//! Only the mount namespace is isolated: move-mounts must not propagate
//! back to the host.

pub mod mount;

//! # with-overlayfs-core
//!
//! Low-level Linux primitives behind `with-overlayfs`.
//!
//! This crate provides safe abstractions over:
//! - **Scratch directories**: `mkdtemp(3)` directories removed on drop.
//! - **Overlays**: mounting a copy-on-write layer and moving it over the
//!   original directory, plus lazy detachment.
//! - **File substitution**: copying replacement files into a mounted overlay.
//! - **Mount namespace**: a private, recursively unshared mount table.
//! - **Privilege**: capturing the invoker's real identity and dropping to it.
//!
//! All system calls go through `nix` and are mapped into
//! [`with_overlayfs_common::error::OverlayError`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod filesystem;
pub mod namespace;
pub mod privilege;

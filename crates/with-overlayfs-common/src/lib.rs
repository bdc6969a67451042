//! # with-overlayfs-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the with-overlayfs workspace.
//!
//! This crate is the leaf of the dependency graph. It is also linked into
//! the injected startup hook, so it stays free of logging and syscall code.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

//! Filesystem management for overlaid directories.
//!
//! Provides scoped scratch directories, `OverlayFS` construction and
//! teardown, and replacement of files inside a mounted overlay.

pub mod overlayfs;
pub mod replace;
pub mod scratch;

//! File substitution inside a mounted overlay.
//!
//! Substitution is split in two phases. [`prepare`] runs while still
//! privileged: it records the source's metadata and keeps an open handle,
//! since the invoking user may not be able to read the source. After the
//! privilege drop, [`ReplacementState::apply`] writes the content through the
//! overlay, so it lands in the upper layer owned by the invoking user.

use std::fs::{File, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use with_overlayfs_common::constants::MODE_TYPE_MASK;
use with_overlayfs_common::error::{OverlayError, Result};
use with_overlayfs_common::types::{MountState, ReplacementSpec};

use super::overlayfs::OverlayMount;

/// A captured replacement, ready to be written into its overlay.
#[derive(Debug)]
pub struct ReplacementState {
    spec: ReplacementSpec,
    target: PathBuf,
    source: File,
    size: u64,
    mode: u32,
}

/// Captures the source of `spec` for the overlay it belongs to.
///
/// The target is registered in the overlay's upper layer for removal on
/// cleanup.
///
/// # Errors
///
/// Returns [`OverlayError::Mount`] if the overlay has not been moved into
/// place, or [`OverlayError::Io`] if the source cannot be opened or stat'ed.
pub fn prepare(overlay: &mut OverlayMount, spec: &ReplacementSpec) -> Result<ReplacementState> {
    if overlay.state() != MountState::Moved {
        return Err(OverlayError::Mount {
            target: overlay.target().to_path_buf(),
            message: format!("cannot substitute into an overlay that is {}", overlay.state()),
        });
    }

    let source = File::open(&spec.source).map_err(|e| OverlayError::io(&spec.source, e))?;
    let metadata = source
        .metadata()
        .map_err(|e| OverlayError::io(&spec.source, e))?;

    let target = overlay.target().join(&spec.target);
    overlay.upper_mut().register_file(&spec.target);

    tracing::debug!(
        source = %spec.source.display(),
        path = %target.display(),
        size = metadata.len(),
        "replacement captured"
    );
    Ok(ReplacementState {
        spec: spec.clone(),
        target,
        source,
        size: metadata.len(),
        mode: permission_bits(metadata.permissions().mode()),
    })
}

impl ReplacementState {
    /// The replacement this state was captured for.
    pub const fn spec(&self) -> &ReplacementSpec {
        &self.spec
    }

    /// Absolute path of the file inside the overlaid directory.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Source size at capture time.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Permission bits that will be applied to the target.
    pub const fn mode(&self) -> u32 {
        self.mode
    }

    /// Replaces the target with the captured source content and mode.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Io`] if the target cannot be removed, created,
    /// written, or chmod'ed.
    pub fn apply(mut self) -> Result<u64> {
        match std::fs::remove_file(&self.target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(OverlayError::io(&self.target, e)),
        }

        let mut dst = File::create(&self.target).map_err(|e| OverlayError::io(&self.target, e))?;
        let written =
            std::io::copy(&mut self.source, &mut dst).map_err(|e| OverlayError::io(&self.target, e))?;
        dst.set_permissions(Permissions::from_mode(self.mode))
            .map_err(|e| OverlayError::io(&self.target, e))?;

        if written != self.size {
            tracing::warn!(
                source = %self.spec.source.display(),
                expected = self.size,
                written,
                "source changed size while being copied"
            );
        }
        tracing::info!(
            path = %self.target.display(),
            mode = format_args!("{:o}", self.mode),
            bytes = written,
            "file substituted"
        );
        Ok(written)
    }
}

/// Strips the file-type bits from an `st_mode` value.
pub const fn permission_bits(st_mode: u32) -> u32 {
    st_mode & !MODE_TYPE_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits_drop_type() {
        assert_eq!(permission_bits(0o100_644), 0o644);
        assert_eq!(permission_bits(0o100_755), 0o755);
        assert_eq!(permission_bits(0o102_750), 0o2750);
    }

    fn captured(target_dir: &Path, source: &Path, name: &str) -> ReplacementState {
        let file = File::open(source).unwrap();
        let metadata = file.metadata().unwrap();
        ReplacementState {
            spec: ReplacementSpec::new(name, source),
            target: target_dir.join(name),
            source: file,
            size: metadata.len(),
            mode: permission_bits(metadata.permissions().mode()),
        }
    }

    #[test]
    fn apply_replaces_content_and_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("custom.json");
        std::fs::write(&source, br#"{"mode":"custom"}"#).unwrap();
        std::fs::set_permissions(&source, Permissions::from_mode(0o644)).unwrap();

        let dir = tmp.path().join("app");
        std::fs::create_dir(&dir).unwrap();
        let target = dir.join("config.json");
        std::fs::write(&target, b"original content that is longer").unwrap();
        std::fs::set_permissions(&target, Permissions::from_mode(0o600)).unwrap();

        let state = captured(&dir, &source, "config.json");
        let written = state.apply().unwrap();

        assert_eq!(written, 17);
        assert_eq!(std::fs::read(&target).unwrap(), br#"{"mode":"custom"}"#);
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(permission_bits(mode), 0o644);
    }

    #[test]
    fn apply_creates_missing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("run.sh");
        std::fs::write(&source, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&source, Permissions::from_mode(0o750)).unwrap();

        let dir = tmp.path().join("bin");
        std::fs::create_dir(&dir).unwrap();

        captured(&dir, &source, "run.sh").apply().unwrap();
        let mode = std::fs::metadata(dir.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(permission_bits(mode), 0o750);
    }

    #[test]
    fn apply_into_missing_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src");
        std::fs::write(&source, b"x").unwrap();

        let state = captured(&tmp.path().join("nope"), &source, "file");
        assert!(matches!(state.apply(), Err(OverlayError::Io { .. })));
    }
}

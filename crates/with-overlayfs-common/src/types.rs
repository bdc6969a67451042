//! Domain types shared across the workspace.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, Result};

/// A single file to substitute inside an overlaid directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementSpec {
    /// Path of the file to replace, relative to the overlaid directory.
    pub target: PathBuf,
    /// File whose contents and permission bits are copied in.
    pub source: PathBuf,
}

impl ReplacementSpec {
    /// Creates a replacement of `target` by the contents of `source`.
    pub fn new(target: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            source: source.into(),
        }
    }

    /// Checks that the target stays inside the overlaid directory.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidSpec`] if the target is empty, absolute,
    /// or climbs out through `..`, or if the source is empty.
    pub fn validate(&self, context: &[String]) -> Result<()> {
        let invalid = |message: String| OverlayError::InvalidSpec {
            context: context.to_vec(),
            message,
        };

        if self.target.as_os_str().is_empty() {
            return Err(invalid("replacement target is empty".into()));
        }
        if self.source.as_os_str().is_empty() {
            return Err(invalid(format!(
                "replacement source for {} is empty",
                self.target.display()
            )));
        }
        let escapes = self
            .target
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || !self.target.components().any(|c| matches!(c, Component::Normal(_))) {
            return Err(invalid(format!(
                "replacement target {} must be a relative path inside the directory",
                self.target.display()
            )));
        }
        Ok(())
    }
}

/// A directory to overlay, with the files to substitute inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySpec {
    /// Absolute path of the directory that becomes the overlay's lower layer.
    pub path: PathBuf,
    /// Substitutions applied in order once the overlay is in place.
    pub replacements: Vec<ReplacementSpec>,
}

impl DirectorySpec {
    /// Creates a directory spec with no replacements.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            replacements: Vec::new(),
        }
    }

    /// Adds a replacement, builder style.
    #[must_use]
    pub fn with_replacement(mut self, target: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        self.replacements.push(ReplacementSpec::new(target, source));
        self
    }

    /// Absolute path a replacement's target resolves to.
    pub fn target_path(&self, replacement: &ReplacementSpec) -> PathBuf {
        self.path.join(&replacement.target)
    }

    /// Validates the directory and all of its replacements.
    ///
    /// The path ends up inside overlay mount options, so it may not contain
    /// the option (`,`) or layer (`:`) separators.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidSpec`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let context = vec![self.path.display().to_string()];
        let invalid = |message: &str| OverlayError::InvalidSpec {
            context: context.clone(),
            message: message.to_owned(),
        };

        if !self.path.is_absolute() {
            return Err(invalid("directory path must be absolute"));
        }
        if has_option_separator(&self.path) {
            return Err(invalid("directory path may not contain ',' or ':'"));
        }
        if !self.path.is_dir() {
            return Err(invalid("directory does not exist"));
        }
        for replacement in &self.replacements {
            replacement.validate(&context)?;
        }
        Ok(())
    }
}

fn has_option_separator(path: &Path) -> bool {
    path.to_string_lossy().contains([',', ':'])
}

/// A fully parsed invocation: what to overlay and what to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Directories to overlay, in the order given.
    pub dirs: Vec<DirectorySpec>,
    /// Target program followed by its arguments.
    pub command: Vec<String>,
}

impl Invocation {
    /// Validates every directory and checks that a program was given.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidSpec`] for the first invalid entry.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(OverlayError::InvalidSpec {
                context: Vec::new(),
                message: "program and arguments not specified".into(),
            });
        }
        self.dirs.iter().try_for_each(DirectorySpec::validate)
    }
}

/// Lifecycle of an overlay mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountState {
    /// Mounted at the staging mountpoint.
    Mounted,
    /// Moved over the original directory.
    Moved,
    /// Detached from the namespace.
    Unmounted,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mounted => write!(f, "mounted"),
            Self::Moved => write!(f, "moved"),
            Self::Unmounted => write!(f, "unmounted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_context() -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn replacement_accepts_nested_relative_target() {
        let r = ReplacementSpec::new("etc/config.json", "/tmp/custom.json");
        assert!(r.validate(&no_context()).is_ok());
    }

    #[test]
    fn replacement_rejects_absolute_target() {
        let r = ReplacementSpec::new("/etc/passwd", "/tmp/x");
        assert!(r.validate(&no_context()).is_err());
    }

    #[test]
    fn replacement_rejects_parent_traversal() {
        let r = ReplacementSpec::new("../outside", "/tmp/x");
        assert!(r.validate(&no_context()).is_err());
    }

    #[test]
    fn replacement_rejects_bare_dot() {
        let r = ReplacementSpec::new(".", "/tmp/x");
        assert!(r.validate(&no_context()).is_err());
    }

    #[test]
    fn replacement_rejects_empty_source() {
        let r = ReplacementSpec::new("config.json", "");
        assert!(r.validate(&no_context()).is_err());
    }

    #[test]
    fn directory_must_be_absolute() {
        let err = DirectorySpec::new("relative/dir").validate().unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
        assert!(err.to_string().contains("(under: relative/dir)"));
    }

    #[test]
    fn directory_rejects_option_separators() {
        let tmp = tempfile::tempdir().unwrap();
        let odd = tmp.path().join("a,b");
        std::fs::create_dir(&odd).unwrap();
        assert!(DirectorySpec::new(&odd).validate().is_err());
    }

    #[test]
    fn directory_must_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("missing");
        let err = DirectorySpec::new(&missing).validate().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn directory_validation_reports_replacement_context() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = DirectorySpec::new(tmp.path()).with_replacement("../x", "/tmp/y");
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains(&tmp.path().display().to_string()));
    }

    #[test]
    fn target_path_joins_directory() {
        let spec = DirectorySpec::new("/srv/app").with_replacement("config.json", "/tmp/custom.json");
        assert_eq!(
            spec.target_path(&spec.replacements[0]),
            PathBuf::from("/srv/app/config.json")
        );
    }

    #[test]
    fn invocation_requires_a_program() {
        let inv = Invocation {
            dirs: Vec::new(),
            command: Vec::new(),
        };
        assert!(inv.validate().is_err());
    }

    #[test]
    fn mount_state_display() {
        assert_eq!(MountState::Moved.to_string(), "moved");
    }
}

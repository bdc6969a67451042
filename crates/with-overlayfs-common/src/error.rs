//! Unified error type for the with-overlayfs workspace.
//!
//! Every fallible step returns this type; the first failure aborts the whole
//! run. There is no partial recovery beyond scoped cleanup.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A directory or replacement specification is malformed.
    #[error("{message}{}", render_context(.context))]
    InvalidSpec {
        /// Enclosing directory blocks, outermost first.
        context: Vec<String>,
        /// Description of the problem.
        message: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Creating or configuring the mount namespace failed.
    #[error("mount namespace setup failed: {message}")]
    Namespace {
        /// Description of the failure.
        message: String,
    },

    /// A mount, move-mount, or unmount failed.
    #[error("mount operation on {target} failed: {message}")]
    Mount {
        /// Mount point involved.
        target: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// Reading or changing process credentials failed.
    #[error("privilege transition failed: {message}")]
    Privilege {
        /// Description of the failure.
        message: String,
    },

    /// The deferred-unmount handshake could not be completed.
    #[error("handshake failed: {message}")]
    Handshake {
        /// Description of the failure.
        message: String,
    },

    /// Forking, executing, or waiting for a child process failed.
    #[error("process error: {message}")]
    Process {
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl OverlayError {
    /// Builds an [`OverlayError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

fn render_context(context: &[String]) -> String {
    if context.is_empty() {
        return String::new();
    }
    let mut s = String::from(" (under");
    for c in context {
        s.push_str(": ");
        s.push_str(c);
    }
    s.push(')');
    s
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, OverlayError>;

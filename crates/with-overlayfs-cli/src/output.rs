//! Rendering of the `--dry-run` plan.

use std::path::Path;

use serde::Serialize;
use with_overlayfs_common::config::RunConfig;
use with_overlayfs_common::error::Result;
use with_overlayfs_common::types::{DirectorySpec, Invocation};

/// What a run would do, in the order it would do it.
#[derive(Debug, Serialize)]
pub struct Plan<'a> {
    /// Overlays, in construction order.
    pub overlays: Vec<PlannedOverlay<'a>>,
    /// Program and arguments.
    pub command: &'a [String],
    /// Settings in effect.
    pub config: &'a RunConfig,
}

/// One overlay of a [`Plan`].
#[derive(Debug, Serialize)]
pub struct PlannedOverlay<'a> {
    /// Directory that becomes the lower layer and is covered by the overlay.
    pub target: &'a Path,
    /// Files replaced after privileges are dropped.
    pub replacements: Vec<PlannedReplacement<'a>>,
}

/// One substitution of a [`PlannedOverlay`].
#[derive(Debug, Serialize)]
pub struct PlannedReplacement<'a> {
    /// Absolute path of the file as seen by the target.
    pub path: String,
    /// File whose contents and permission bits are copied in.
    pub source: &'a Path,
}

impl<'a> Plan<'a> {
    /// Builds the plan for `invocation` under `config`.
    pub fn new(invocation: &'a Invocation, config: &'a RunConfig) -> Self {
        Self {
            overlays: invocation.dirs.iter().map(planned_overlay).collect(),
            command: &invocation.command,
            config,
        }
    }
}

fn planned_overlay(dir: &DirectorySpec) -> PlannedOverlay<'_> {
    PlannedOverlay {
        target: &dir.path,
        replacements: dir
            .replacements
            .iter()
            .map(|r| PlannedReplacement {
                path: dir.target_path(r).display().to_string(),
                source: &r.source,
            })
            .collect(),
    }
}

/// Renders `plan` as pretty-printed JSON.
///
/// # Errors
///
/// Returns [`OverlayError::Serialization`](with_overlayfs_common::error::OverlayError::Serialization)
/// if a path cannot be encoded.
pub fn render_plan(plan: &Plan<'_>) -> Result<String> {
    Ok(serde_json::to_string_pretty(plan)?)
}

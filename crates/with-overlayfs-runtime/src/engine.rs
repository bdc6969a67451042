//! Supervisor that sequences a whole invocation.
//!
//! Order of operations:
//! 1. capture the invoking user's real identity;
//! 2. unshare a private mount namespace;
//! 3. build and move every overlay, in the order given;
//! 4. capture every replacement source;
//! 5. fork the scratch reaper, which removes scratch storage with privilege
//!    once the supervisor is done;
//! 6. fork the unmount helper, if deferred unmount was requested;
//! 7. drop privileges;
//! 8. write the replacements through the overlays;
//! 9. launch the target, then wait for it, the helper, and the reaper.

use with_overlayfs_common::config::RunConfig;
use with_overlayfs_common::error::Result;
use with_overlayfs_common::types::Invocation;
use with_overlayfs_core::filesystem::overlayfs::OverlayMount;
use with_overlayfs_core::filesystem::replace::{self, ReplacementState};
use with_overlayfs_core::namespace::mount::create_private_mount_namespace;
use with_overlayfs_core::privilege::{self, Identity};

use crate::cleanup::ScratchReaper;
use crate::handshake::{HandshakeChannel, HookEndpoint};
use crate::helper::UnmountHelper;
use crate::process::{self, ExitOutcome, HookHandoff, TargetCommand};

/// Runs invocations under a fixed configuration.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: RunConfig,
}

impl Supervisor {
    /// Creates a supervisor with the given configuration.
    pub const fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// Configuration in effect.
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Builds the overlays, runs the target, and returns how it ended.
    ///
    /// Scratch directories are removed before this returns, on success and
    /// on every error path, by a process that kept root for the purpose.
    ///
    /// # Errors
    ///
    /// Returns the first failure of any setup step. Failures of the target
    /// itself (including a failed `exec`) are reported through the returned
    /// [`ExitOutcome`] instead.
    pub fn run(&self, invocation: &Invocation) -> Result<ExitOutcome> {
        invocation.validate()?;
        self.config.validate()?;
        let command = TargetCommand::new(&invocation.command)?;

        let identity = Identity::capture_real()?;
        privilege::require_effective_root()?;
        create_private_mount_namespace()?;

        let mut overlays = Vec::with_capacity(invocation.dirs.len());
        for dir in &invocation.dirs {
            overlays.push(OverlayMount::build(dir, identity, &self.config.scratch_dir)?);
        }

        let mut replacements = Vec::new();
        for (dir, overlay) in invocation.dirs.iter().zip(overlays.iter_mut()) {
            for spec in &dir.replacements {
                replacements.push(replace::prepare(overlay, spec)?);
            }
        }

        let reaper = ScratchReaper::spawn(
            overlays
                .iter_mut()
                .flat_map(OverlayMount::scratch_dirs_mut)
                .collect(),
        )?;

        let (helper, hook) = if self.config.discard_after_exec {
            let targets = overlays.iter().map(|o| o.target().to_path_buf()).collect();
            let (helper, hook) = UnmountHelper::spawn(HandshakeChannel::new()?, targets)?;
            (Some(helper), Some(hook))
        } else {
            (None, None)
        };

        let launched = self.launch(&command, identity, replacements, hook.as_ref());
        // Closing the supervisor's copy lets the helper see end-of-stream if
        // the target never runs the hook.
        drop(hook);
        let outcome = launched.and_then(process::wait_for);

        if let Some(helper) = helper {
            if helper.wait()? {
                overlays.iter_mut().for_each(OverlayMount::mark_detached);
            }
        }

        drop(reaper);

        let outcome = outcome?;
        tracing::info!(outcome = %outcome, "target finished");
        Ok(outcome)
    }

    fn launch(
        &self,
        command: &TargetCommand,
        identity: Identity,
        replacements: Vec<ReplacementState>,
        hook: Option<&HookEndpoint>,
    ) -> Result<nix::unistd::Pid> {
        privilege::drop_to(identity)?;
        for replacement in replacements {
            let _ = replacement.apply()?;
        }
        let handoff = hook.map(|endpoint| HookHandoff {
            endpoint,
            hook_path: &self.config.hook_path,
        });
        process::spawn_target(command, handoff)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use with_overlayfs_common::error::OverlayError;
    use with_overlayfs_common::types::DirectorySpec;

    use super::*;

    fn config_in(scratch: &std::path::Path) -> RunConfig {
        RunConfig {
            scratch_dir: scratch.to_path_buf(),
            ..RunConfig::default()
        }
    }

    #[test]
    fn invalid_invocation_fails_before_setup() {
        let scratch = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(config_in(scratch.path()));
        let invocation = Invocation {
            dirs: vec![DirectorySpec::new("relative")],
            command: vec!["true".into()],
        };
        let err = supervisor.run(&invocation).unwrap_err();
        assert!(matches!(err, OverlayError::InvalidSpec { .. }));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_hook_fails_before_setup() {
        let supervisor = Supervisor::new(RunConfig {
            hook_path: PathBuf::from("/nonexistent/hook.so"),
            discard_after_exec: true,
            ..RunConfig::default()
        });
        let invocation = Invocation {
            dirs: Vec::new(),
            command: vec!["true".into()],
        };
        let err = supervisor.run(&invocation).unwrap_err();
        assert!(matches!(err, OverlayError::Config { .. }));
        assert!(err.to_string().contains("hook"));
    }

    #[test]
    fn invoker_owned_scratch_dir_is_refused() {
        let scratch = tempfile::tempdir().unwrap();
        if nix::unistd::geteuid().is_root() {
            nix::unistd::chown(
                scratch.path(),
                Some(nix::unistd::Uid::from_raw(65_534)),
                Some(nix::unistd::Gid::from_raw(65_534)),
            )
            .unwrap();
        }
        let supervisor = Supervisor::new(config_in(scratch.path()));
        let invocation = Invocation {
            dirs: Vec::new(),
            command: vec!["true".into()],
        };
        let err = supervisor.run(&invocation).unwrap_err();
        assert!(err.to_string().contains("owned by root"));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn unprivileged_run_is_refused() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let supervisor = Supervisor::new(RunConfig::default());
        let invocation = Invocation {
            dirs: Vec::new(),
            command: vec!["true".into()],
        };
        assert!(matches!(
            supervisor.run(&invocation),
            Err(OverlayError::Privilege { .. })
        ));
    }
}

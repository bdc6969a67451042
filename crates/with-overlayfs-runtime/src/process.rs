//! Launching the target program and collecting exit statuses.
//!
//! The target is forked and executed with `execvp` semantics: the argument
//! vector and working directory pass through unmodified. With a hook
//! handoff, the only change is the environment: the hook library is
//! preloaded and the handshake descriptor number is published.

use std::ffi::{CString, OsString};
use std::fmt;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execvp, execvpe, fork};
use with_overlayfs_common::constants::{
    AFTER_LOAD_ENV, EXIT_EXEC_FAILURE, EXIT_SETUP_FAILURE, EXIT_SIGNAL_BASE, PRELOAD_ENV,
};
use with_overlayfs_common::error::{OverlayError, Result};

use crate::handshake::HookEndpoint;

/// The target program and its arguments, ready for `exec`.
#[derive(Debug, Clone)]
pub struct TargetCommand {
    argv: Vec<CString>,
}

impl TargetCommand {
    /// Converts `command` (program first) into C strings.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::Process`] if the command is empty or an
    /// argument contains a NUL byte.
    pub fn new(command: &[String]) -> Result<Self> {
        if command.is_empty() {
            return Err(OverlayError::Process {
                message: "no program to execute".into(),
            });
        }
        let argv = command
            .iter()
            .map(|arg| {
                CString::new(arg.as_bytes()).map_err(|_| OverlayError::Process {
                    message: format!("argument {arg:?} contains a NUL byte"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { argv })
    }

    /// Program name or path, as given.
    pub fn program(&self) -> &CString {
        &self.argv[0]
    }
}

/// What the target needs to run the startup hook.
#[derive(Debug, Clone, Copy)]
pub struct HookHandoff<'a> {
    /// Endpoint inherited by the target.
    pub endpoint: &'a HookEndpoint,
    /// Library preloaded into the target.
    pub hook_path: &'a Path,
}

/// Builds the target environment for a hook handoff.
///
/// Any existing preload or handshake variable is replaced; everything else
/// is passed through unchanged.
///
/// # Errors
///
/// Returns [`OverlayError::Process`] if a variable contains a NUL byte.
pub fn handoff_environment(
    base: impl IntoIterator<Item = (OsString, OsString)>,
    fd: RawFd,
    hook_path: &Path,
) -> Result<Vec<CString>> {
    let mut env = Vec::new();
    for (key, value) in base {
        if key == PRELOAD_ENV || key == AFTER_LOAD_ENV {
            continue;
        }
        let mut entry = key.as_bytes().to_vec();
        entry.push(b'=');
        entry.extend_from_slice(value.as_bytes());
        env.push(env_entry(entry)?);
    }

    let mut preload = format!("{PRELOAD_ENV}=").into_bytes();
    preload.extend_from_slice(hook_path.as_os_str().as_bytes());
    env.push(env_entry(preload)?);
    env.push(env_entry(format!("{AFTER_LOAD_ENV}={fd}").into_bytes())?);
    Ok(env)
}

fn env_entry(bytes: Vec<u8>) -> Result<CString> {
    CString::new(bytes).map_err(|e| OverlayError::Process {
        message: format!("environment entry contains a NUL byte: {e}"),
    })
}

/// Forks and executes the target.
///
/// If `exec` fails the child reports the error and exits with status 127,
/// closing its copy of the hook endpoint on the way out.
///
/// # Errors
///
/// Returns [`OverlayError::Process`] if the environment cannot be built or
/// `fork(2)` fails.
pub fn spawn_target(command: &TargetCommand, handoff: Option<HookHandoff<'_>>) -> Result<Pid> {
    let env = handoff
        .map(|h| handoff_environment(std::env::vars_os(), h.endpoint.raw_fd(), h.hook_path))
        .transpose()?;

    // SAFETY: the supervisor is single-threaded; the child either replaces
    // its image or leaves through `_exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let err = exec_target(command, handoff, env.as_deref());
            tracing::error!(
                program = %command.program().to_string_lossy(),
                error = %err,
                "failed to execute target"
            );
            // SAFETY: skips destructors of the supervisor state copied here.
            unsafe { libc::_exit(EXIT_EXEC_FAILURE) }
        }
        Ok(ForkResult::Parent { child }) => {
            tracing::info!(
                pid = child.as_raw(),
                program = %command.program().to_string_lossy(),
                hook = handoff.is_some(),
                "target launched"
            );
            Ok(child)
        }
        Err(e) => Err(OverlayError::Process {
            message: format!("fork of target failed: {e}"),
        }),
    }
}

fn exec_target(
    command: &TargetCommand,
    handoff: Option<HookHandoff<'_>>,
    env: Option<&[CString]>,
) -> OverlayError {
    if let Some(handoff) = handoff {
        if let Err(e) = handoff.endpoint.inherit_across_exec() {
            return e;
        }
    }
    let result = match env {
        Some(env) => execvpe(command.program(), &command.argv, env),
        None => execvp(command.program(), &command.argv),
    };
    match result {
        Ok(never) => match never {},
        Err(e) => OverlayError::Process {
            message: format!("exec failed: {e}"),
        },
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with the given status.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
}

impl ExitOutcome {
    /// Status to exit the supervisor with.
    ///
    /// Normal exits propagate unchanged; signals map to `128 + signo`, the
    /// status a POSIX shell reports for a signaled child. A target that
    /// itself exits with `128 + signo` is indistinguishable from one killed
    /// by that signal, exactly as under `sh -c`.
    pub fn exit_code(self) -> u8 {
        let code = match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => EXIT_SIGNAL_BASE + signal as i32,
        };
        u8::try_from(code).unwrap_or(EXIT_SETUP_FAILURE)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(signal) => write!(f, "killed by {signal}"),
        }
    }
}

/// Blocks until `pid` exits or is killed.
///
/// # Errors
///
/// Returns [`OverlayError::Process`] if `waitpid(2)` fails.
pub fn wait_for(pid: Pid) -> Result<ExitOutcome> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitOutcome::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ExitOutcome::Signaled(signal)),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(OverlayError::Process {
                    message: format!("waitpid({pid}) failed: {e}"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeChannel;

    fn sh(script: &str) -> TargetCommand {
        TargetCommand::new(&["sh".into(), "-c".into(), script.into()]).unwrap()
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(TargetCommand::new(&[]).is_err());
    }

    #[test]
    fn nul_in_argument_is_rejected() {
        assert!(TargetCommand::new(&["echo".into(), "a\0b".into()]).is_err());
    }

    #[test]
    fn exit_status_is_propagated() {
        let pid = spawn_target(&sh("exit 3"), None).unwrap();
        let outcome = wait_for(pid).unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(3));
        assert_eq!(outcome.exit_code(), 3);
    }

    #[test]
    fn signal_maps_to_distinct_status() {
        let pid = spawn_target(&sh("kill -TERM $$"), None).unwrap();
        let outcome = wait_for(pid).unwrap();
        assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGTERM));
        assert_eq!(outcome.exit_code(), 143);
    }

    #[test]
    fn signal_status_matches_the_shell_convention() {
        let pid = spawn_target(&sh("kill -KILL $$"), None).unwrap();
        let outcome = wait_for(pid).unwrap();
        assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGKILL));
        assert_eq!(outcome.exit_code(), 137);
        assert_ne!(outcome.exit_code(), 0);
    }

    #[test]
    fn missing_program_exits_127() {
        let command = TargetCommand::new(&["/nonexistent/with-overlayfs-target".into()]).unwrap();
        let pid = spawn_target(&command, None).unwrap();
        assert_eq!(wait_for(pid).unwrap(), ExitOutcome::Exited(127));
    }

    #[test]
    fn handoff_environment_replaces_preload() {
        let base = vec![
            (OsString::from("PATH"), OsString::from("/usr/bin")),
            (OsString::from(PRELOAD_ENV), OsString::from("/tmp/other.so")),
            (OsString::from(AFTER_LOAD_ENV), OsString::from("99")),
        ];
        let env = handoff_environment(base, 5, Path::new("/usr/lib/hook.so")).unwrap();
        let env: Vec<String> = env
            .into_iter()
            .map(|e| e.into_string().unwrap())
            .collect();
        assert_eq!(
            env,
            vec![
                "PATH=/usr/bin".to_owned(),
                format!("{PRELOAD_ENV}=/usr/lib/hook.so"),
                format!("{AFTER_LOAD_ENV}=5"),
            ]
        );
    }

    #[test]
    fn hook_descriptor_survives_exec() {
        let (_helper, hook) = HandshakeChannel::new().unwrap().split();
        let handoff = HookHandoff {
            endpoint: &hook,
            hook_path: Path::new("/nonexistent/libwith_overlayfs_hook.so"),
        };
        let script = format!("test -e /proc/self/fd/${AFTER_LOAD_ENV}");
        let pid = spawn_target(&sh(&script), Some(handoff)).unwrap();
        assert_eq!(wait_for(pid).unwrap(), ExitOutcome::Exited(0));
    }

    #[test]
    fn outcome_display() {
        assert_eq!(ExitOutcome::Exited(0).to_string(), "exited with status 0");
        assert_eq!(
            ExitOutcome::Signaled(Signal::SIGKILL).to_string(),
            "killed by SIGKILL"
        );
    }
}

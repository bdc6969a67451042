//! End-to-end tests for the deferred-unmount machinery.
//!
//! These run unprivileged: the helper is forked with no overlays to detach,
//! so only the process plumbing is exercised:
//! 1. Target launch with and without a hook handoff
//! 2. Helper, hook, and target completing the three-party handshake
//! 3. Helper failure when the target never loads the hook

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::print_stderr)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use with_overlayfs_runtime::handshake::HandshakeChannel;
use with_overlayfs_runtime::helper::UnmountHelper;
use with_overlayfs_runtime::process::{self, ExitOutcome, HookHandoff, TargetCommand};

// Forked children inherit every descriptor open in this process; helpers
// from concurrent tests would hold each other's channels open.
static FORK_GUARD: Mutex<()> = Mutex::new(());

fn sh(script: &str) -> TargetCommand {
    TargetCommand::new(&["sh".into(), "-c".into(), script.into()]).unwrap()
}

fn hook_library() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let deps = exe.parent()?;
    let profile = deps.parent()?;
    [profile, deps]
        .into_iter()
        .map(|d| d.join("libwith_overlayfs_hook.so"))
        .find(|p| p.is_file())
}

fn run_with_helper(script: &str, hook_path: &Path) -> (ExitOutcome, bool) {
    let _guard = FORK_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
    let (helper, hook) = UnmountHelper::spawn(HandshakeChannel::new().unwrap(), Vec::new()).unwrap();
    let handoff = HookHandoff {
        endpoint: &hook,
        hook_path,
    };
    let pid = process::spawn_target(&sh(script), Some(handoff)).unwrap();
    drop(hook);
    let outcome = process::wait_for(pid).unwrap();
    (outcome, helper.wait().unwrap())
}

// ── Target launch ────────────────────────────────────────────────────

#[test]
fn target_without_handoff_sees_unmodified_environment() {
    let _guard = FORK_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
    let out = tempfile::tempdir().unwrap();
    let file = out.path().join("env");
    let script = format!(
        "printf %s \"${{WITH_OVERLAYFS_AFTER_LOAD_FD-unset}}\" > {}",
        file.display()
    );
    let pid = process::spawn_target(&sh(&script), None).unwrap();
    assert_eq!(process::wait_for(pid).unwrap(), ExitOutcome::Exited(0));
    assert_eq!(fs::read_to_string(file).unwrap(), "unset");
}

// ── Handshake ────────────────────────────────────────────────────────

#[test]
fn hook_signals_helper_and_scrubs_environment() {
    let Some(hook) = hook_library() else {
        eprintln!("skipping: hook library not built");
        return;
    };
    let script = "test -z \"${WITH_OVERLAYFS_AFTER_LOAD_FD-}\" && test -z \"${LD_PRELOAD-}\"";
    let (outcome, detached) = run_with_helper(script, &hook);
    assert_eq!(outcome, ExitOutcome::Exited(0));
    assert!(detached);
}

#[test]
fn helper_fails_when_target_never_loads_hook() {
    let (outcome, detached) =
        run_with_helper("exit 0", Path::new("/nonexistent/libwith_overlayfs_hook.so"));
    assert_eq!(outcome, ExitOutcome::Exited(0));
    assert!(!detached);
}

#[test]
fn helper_fails_when_exec_fails() {
    let _guard = FORK_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
    let (helper, hook) = UnmountHelper::spawn(HandshakeChannel::new().unwrap(), Vec::new()).unwrap();
    let command = TargetCommand::new(&["/nonexistent/with-overlayfs-target".into()]).unwrap();
    let handoff = HookHandoff {
        endpoint: &hook,
        hook_path: Path::new("/nonexistent/libwith_overlayfs_hook.so"),
    };
    let pid = process::spawn_target(&command, Some(handoff)).unwrap();
    drop(hook);
    assert_eq!(process::wait_for(pid).unwrap(), ExitOutcome::Exited(127));
    assert!(!helper.wait().unwrap());
}

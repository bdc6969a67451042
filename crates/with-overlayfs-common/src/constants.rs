//! System-wide constants, default paths, and protocol values.

/// Application name used in diagnostics and scratch directory names.
pub const APP_NAME: &str = "with-overlayfs";

/// Default base directory for upper/work/mountpoint scratch directories.
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp";

/// Prefix of every scratch directory; `mkdtemp(3)` appends six characters.
pub const SCRATCH_PREFIX: &str = "with-overlayfs";

/// Name of the subdirectory the kernel creates inside an overlay workdir.
pub const OVERLAY_WORK_SUBDIR: &str = "work";

/// Installed location of the startup hook library.
///
/// Packagers override it at build time through `WITH_OVERLAYFS_HOOK_PATH`.
pub const DEFAULT_HOOK_PATH: &str = match option_env!("WITH_OVERLAYFS_HOOK_PATH") {
    Some(path) => path,
    None => "/usr/local/lib/with-overlayfs/libwith_overlayfs_hook.so",
};

/// Environment variable carrying the hook's handshake descriptor number.
pub const AFTER_LOAD_ENV: &str = "WITH_OVERLAYFS_AFTER_LOAD_FD";

/// Environment variable the dynamic loader reads to activate the hook.
pub const PRELOAD_ENV: &str = "LD_PRELOAD";

/// Byte the hook sends once the new program image is resident.
pub const HANDSHAKE_GO: u8 = b'g';

/// Byte the helper sends back once every overlay is detached.
pub const HANDSHAKE_DONE: u8 = b'd';

/// File-type bits of `st_mode` (`S_IFMT`), cleared before reapplying modes.
pub const MODE_TYPE_MASK: u32 = 0o170_000;

/// Exit status for any failure before or around the target program.
pub const EXIT_SETUP_FAILURE: u8 = 255;

/// Exit status of the forked child when `exec` of the target fails.
pub const EXIT_EXEC_FAILURE: i32 = 127;

/// Base added to the signal number when the target is killed by a signal.
pub const EXIT_SIGNAL_BASE: i32 = 128;

/// Exit status of the unmount helper when the handshake did not complete.
pub const EXIT_HELPER_FAILURE: i32 = 1;

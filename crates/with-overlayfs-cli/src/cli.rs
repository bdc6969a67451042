//! Command-line definition and directory block parsing.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};
use with_overlayfs_common::config::RunConfig;
use with_overlayfs_common::constants::{DEFAULT_HOOK_PATH, DEFAULT_SCRATCH_DIR};
use with_overlayfs_common::error::{OverlayError, Result};
use with_overlayfs_common::types::{DirectorySpec, Invocation, ReplacementSpec};

const DIR_START_ID: &str = "dir_start";
const DIR_END: &str = "--dir-end";
const REPLACE: &str = "--replace";

/// Run a program with directories overlaid by a copy-on-write layer and
/// selected files inside them replaced.
#[derive(Parser, Debug)]
#[command(
    name = "with-overlayfs",
    version,
    about,
    long_about = None,
    disable_version_flag = true,
    override_usage = "with-overlayfs [OPTIONS] (--dir-start PATH [--replace TARGET SOURCE]... --dir-end)... -- COMMAND [ARGS]..."
)]
pub struct Cli {
    /// Print version.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,

    /// Overlay a directory. Takes the path, then any number of
    /// `--replace TARGET SOURCE` pairs, and ends with `--dir-end`.
    #[arg(
        id = DIR_START_ID,
        long = "dir-start",
        value_name = "PATH",
        num_args = 1..,
        allow_hyphen_values = true,
        value_terminator = DIR_END,
        action = ArgAction::Append
    )]
    #[allow(dead_code)]
    dir_start: Vec<String>,

    /// Values of each `--dir-start` occurrence, regrouped per block.
    #[arg(skip)]
    pub dir_blocks: Vec<Vec<String>>,

    /// Detach every overlay once the program has loaded, before it runs.
    #[arg(long)]
    pub discard_after_exec: bool,

    /// Startup hook library used by `--discard-after-exec`.
    #[arg(long = "hook", value_name = "PATH", env = "WITH_OVERLAYFS_HOOK", default_value = DEFAULT_HOOK_PATH)]
    pub hook_path: PathBuf,

    /// Directory in which upper, work, and staging directories are created.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_SCRATCH_DIR)]
    pub scratch_dir: PathBuf,

    /// Validate the invocation and print the plan as JSON without running.
    #[arg(long)]
    pub dry_run: bool,

    /// Program to run, followed by its arguments.
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Parses the process arguments, exiting with a usage error on failure.
    pub fn parse_args() -> Self {
        Self::try_parse_args_from(std::env::args_os()).unwrap_or_else(|e| e.exit())
    }

    /// Parses `args`, keeping every `--dir-start` occurrence as its own block.
    ///
    /// A block missing its `--dir-end` swallows the rest of the line; that is
    /// reported by [`parse_dir_block`] with the directory named, so the
    /// command is not required here.
    ///
    /// # Errors
    ///
    /// Returns the clap error for unknown flags, `--help`, and `--version`.
    pub fn try_parse_args_from<I, T>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(args)?;
        let mut cli = Self::from_arg_matches(&matches)?;
        cli.dir_blocks = matches
            .get_occurrences::<String>(DIR_START_ID)
            .map(|occurrences| {
                occurrences
                    .map(|values| values.cloned().collect())
                    .collect()
            })
            .unwrap_or_default();
        Ok(cli)
    }

    /// Splits the parsed command line into the invocation and its settings.
    ///
    /// # Errors
    ///
    /// Returns [`OverlayError::InvalidSpec`] if a directory block is malformed.
    pub fn into_parts(self) -> Result<(Invocation, RunConfig)> {
        let dirs = self
            .dir_blocks
            .iter()
            .map(|block| parse_dir_block(block))
            .collect::<Result<Vec<_>>>()?;
        let config = RunConfig {
            scratch_dir: self.scratch_dir,
            hook_path: self.hook_path,
            discard_after_exec: self.discard_after_exec,
        };
        Ok((
            Invocation {
                dirs,
                command: self.command,
            },
            config,
        ))
    }
}

/// Parses the values of one `--dir-start` occurrence.
///
/// # Errors
///
/// Returns [`OverlayError::InvalidSpec`], naming the enclosing directory,
/// for unknown arguments or an incomplete `--replace` pair.
pub fn parse_dir_block(values: &[String]) -> Result<DirectorySpec> {
    let mut args = values.iter();
    let Some(path) = args.next() else {
        return Err(OverlayError::InvalidSpec {
            context: Vec::new(),
            message: "unexpected end of argument list, expected path".into(),
        });
    };
    let context = vec![path.clone()];
    let invalid = |message: String| OverlayError::InvalidSpec {
        context: context.clone(),
        message,
    };

    let mut dir = DirectorySpec::new(path);
    while let Some(arg) = args.next() {
        if arg != REPLACE {
            return Err(invalid(format!("invalid argument {arg}")));
        }
        let target = args
            .next()
            .ok_or_else(|| invalid("unexpected end of argument list, expected target".into()))?;
        let source = args
            .next()
            .ok_or_else(|| invalid("unexpected end of argument list, expected source".into()))?;
        dir.replacements.push(ReplacementSpec::new(target, source));
    }
    Ok(dir)
}

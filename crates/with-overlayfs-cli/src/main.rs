//! # with-overlayfs
//!
//! Runs a program with directories overlaid by a private copy-on-write layer
//! and selected files inside them replaced. Installed setuid root; the
//! program itself runs with the invoking user's identity.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod cli;
mod output;

use std::process::ExitCode;

use with_overlayfs_common::constants::EXIT_SETUP_FAILURE;
use with_overlayfs_runtime::engine::Supervisor;

use crate::cli::Cli;
use crate::output::Plan;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse_args();
    match execute(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::debug!(error = ?e, "run aborted");
            #[allow(clippy::print_stderr)]
            {
                eprintln!("{}", render_error(&e));
            }
            ExitCode::from(EXIT_SETUP_FAILURE)
        }
    }
}

/// One-line diagnostic for a failed run.
///
/// Workspace errors already carry their cause in their message, so only the
/// outermost error is printed.
fn render_error(e: &anyhow::Error) -> String {
    format!("with-overlayfs: {e}")
}

/// Runs the parsed invocation and returns the status to exit with.
///
/// # Errors
///
/// Returns an error if the invocation is malformed or any setup step fails.
fn execute(cli: Cli) -> anyhow::Result<u8> {
    let dry_run = cli.dry_run;
    let (invocation, config) = cli.into_parts()?;

    if dry_run {
        invocation.validate()?;
        config.validate()?;
        let rendered = output::render_plan(&Plan::new(&invocation, &config))?;
        #[allow(clippy::print_stdout)]
        {
            println!("{rendered}");
        }
        return Ok(0);
    }

    let outcome = Supervisor::new(config).run(&invocation)?;
    Ok(outcome.exit_code())
}

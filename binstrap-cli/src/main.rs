//! Binstrap CLI - fetch and reconcile prebuilt binaries into a working tree.

mod cli;
mod error;
mod logging;
mod prompt;
mod runner;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use crate::cli::Args;
use crate::error::CliError;

fn main() -> ExitCode {
    let args = Args::parse();

    let root = match runner::resolve_root(&args) {
        Ok(root) => root,
        Err(e) => return fail(&e),
    };
    let _log_guard = logging::init(&root, args.verbose);
    tracing::info!(version = binstrap::VERSION, root = %root.display(), "binstrap starting");

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_cancel = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Interrupted, stopping after the current block...");
        handler_cancel.store(true, Ordering::SeqCst);
    }) {
        return fail(&CliError::Setup(format!("Failed to set signal handler: {}", e)));
    }

    match runner::run(&args, &root, cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::info!(error = %e, code = e.exit_code(), "binstrap failed");
            ExitCode::from(e.exit_code())
        }
    }
}

fn fail(err: &CliError) -> ExitCode {
    eprintln!("Error: {}", err);
    ExitCode::from(err.exit_code())
}

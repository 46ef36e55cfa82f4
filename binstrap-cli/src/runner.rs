//! Drives one bootstrap run from parsed arguments.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use binstrap::bootstrap::{working_dir_for, DEFAULT_MANIFEST_URL};
use binstrap::download::HttpTransport;
use binstrap::progress::format_bytes;
use binstrap::reconcile::Classification;
use binstrap::{Bootstrap, BootstrapError, BootstrapOptions, BootstrapSummary};
use console::style;

use crate::cli::Args;
use crate::error::CliError;
use crate::prompt::{confirm_start, ConsolePrompt};

/// Resolve the destination root: `--rootDir`, else the executable's directory.
pub fn resolve_root(args: &Args) -> Result<PathBuf, CliError> {
    if let Some(root) = &args.root_dir {
        return Ok(root.clone());
    }

    let exe = std::env::current_exe()
        .map_err(|e| CliError::Setup(format!("Could not locate executable: {}", e)))?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| CliError::Setup("Executable has no parent directory".to_string()))
}

pub fn build_options(args: &Args, root: &Path) -> BootstrapOptions {
    BootstrapOptions::new(root)
        .with_keep_temp(args.keep)
        .with_clean_temp(args.clean)
        .with_user_policy(args.user_policy())
        .with_default_manifest_url(
            args.default_manifest_url
                .clone()
                .unwrap_or_else(|| DEFAULT_MANIFEST_URL.to_string()),
        )
        .with_download_config(args.download_config())
}

/// Run the bootstrap, reporting the outcome on stdout/stderr.
pub fn run(args: &Args, root: &Path, cancel: Arc<AtomicBool>) -> Result<(), CliError> {
    match execute(args, root, cancel) {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(err) => {
            print_failure(&err, &working_dir_for(root, &std::env::temp_dir()));
            Err(err)
        }
    }
}

fn execute(args: &Args, root: &Path, cancel: Arc<AtomicBool>) -> Result<BootstrapSummary, CliError> {
    if !args.skip_warning {
        let proceed = confirm_start(root).map_err(|e| confirmation_error(e, &cancel))?;
        if !proceed {
            return Err(CliError::Declined);
        }
    }

    let options = build_options(args, root);
    let transport = HttpTransport::new(options.download.timeout).map_err(BootstrapError::from)?;

    let mut bootstrap = Bootstrap::new(options, Arc::new(transport), Box::new(ConsolePrompt), cancel);
    Ok(bootstrap.run()?)
}

/// Ctrl+C at the confirmation prompt is a cancellation, not a setup failure.
fn confirmation_error(err: io::Error, cancel: &AtomicBool) -> CliError {
    if err.kind() == io::ErrorKind::Interrupted || cancel.load(Ordering::SeqCst) {
        return CliError::Bootstrap(BootstrapError::Cancelled);
    }
    CliError::Setup(format!("Could not read confirmation: {}", err))
}

fn print_summary(summary: &BootstrapSummary) {
    let report = &summary.report;
    println!();
    println!("{}", style("Bootstrap complete").green().bold());
    println!(
        "  Downloaded:  {} in {} chunk(s)",
        format_bytes(summary.bytes_downloaded),
        summary.chunks.len()
    );
    println!(
        "  Installed:   {} file(s), {} unchanged",
        report.files_copied,
        report.count(Classification::Identical)
    );
    if report.files_skipped > 0 {
        println!("  Kept local:  {} modified file(s)", report.files_skipped);
    }
    if report.files_deleted > 0 {
        println!("  Removed:     {} obsolete file(s)", report.files_deleted);
    }

    if summary.cleaned_up {
        println!("  Working directory removed.");
    } else {
        println!("  Working directory kept at {}", summary.working_dir.display());
    }
}

fn print_failure(err: &CliError, working_dir: &Path) {
    if matches!(err, CliError::Declined) {
        eprintln!("Nothing changed.");
        return;
    }

    eprintln!();
    eprintln!("{} {}", style("Error:").red().bold(), err);
    if err.resumable() {
        eprintln!(
            "Partial state kept in {}. Run again to resume.",
            working_dir.display()
        );
    } else {
        eprintln!("Fix the problem above and run again.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binstrap::reconcile::UserPolicy;
    use clap::Parser;

    #[test]
    fn test_interrupted_confirmation_exits_as_cancelled() {
        let idle = AtomicBool::new(false);
        let interrupted = io::Error::new(io::ErrorKind::Interrupted, "read interrupted");
        let err = confirmation_error(interrupted, &idle);
        assert!(matches!(err, CliError::Bootstrap(BootstrapError::Cancelled)));
        assert_eq!(err.exit_code(), crate::error::EXIT_CANCELLED);

        let signalled = AtomicBool::new(true);
        let err = confirmation_error(io::Error::other("terminal closed"), &signalled);
        assert_eq!(err.exit_code(), crate::error::EXIT_CANCELLED);
    }

    #[test]
    fn test_broken_confirmation_is_setup_failure() {
        let err = confirmation_error(io::Error::other("terminal closed"), &AtomicBool::new(false));
        assert!(matches!(err, CliError::Setup(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_root_dir_flag_wins() {
        let args = Args::try_parse_from(["binstrap", "--rootDir", "/srv/tree"]).unwrap();
        assert_eq!(resolve_root(&args).unwrap(), PathBuf::from("/srv/tree"));
    }

    #[test]
    fn test_default_root_is_executable_dir() {
        let args = Args::try_parse_from(["binstrap"]).unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(resolve_root(&args).unwrap(), exe.parent().unwrap());
    }

    #[test]
    fn test_options_from_args() {
        let args = Args::try_parse_from([
            "binstrap",
            "-k",
            "-n",
            "--overrideDefaultHashfileURL",
            "https://mirror.test/filehashes.json",
        ])
        .unwrap();
        let options = build_options(&args, Path::new("/srv/tree"));

        assert_eq!(options.root_dir, PathBuf::from("/srv/tree"));
        assert!(options.keep_temp);
        assert!(!options.clean_temp);
        assert_eq!(options.user_policy, UserPolicy::AssumeSkip);
        assert_eq!(options.default_manifest_url, "https://mirror.test/filehashes.json");
    }

    #[test]
    fn test_default_manifest_url_used_verbatim() {
        let args = Args::try_parse_from(["binstrap"]).unwrap();
        let options = build_options(&args, Path::new("/srv/tree"));
        assert_eq!(options.default_manifest_url, DEFAULT_MANIFEST_URL);
    }
}

//! Console prompts.

use std::io;
use std::path::Path;

use binstrap::reconcile::ConflictPrompt;
use console::{style, Term};
use dialoguer::{Confirm, Input};

/// Asks on the terminal whether a locally modified file may be replaced.
#[derive(Debug, Default)]
pub struct ConsolePrompt;

impl ConflictPrompt for ConsolePrompt {
    fn ask(&mut self, path: &Path) -> io::Result<String> {
        if !Term::stderr().is_term() {
            return Err(io::Error::other("not attached to a terminal"));
        }

        Input::<String>::new()
            .with_prompt(format!(
                "{} was modified locally. Overwrite? [y]es / [n]o / yes all / no all",
                style(path.display()).yellow()
            ))
            .allow_empty(true)
            .interact_text()
            .map_err(io::Error::from)
    }
}

/// Show what is about to happen and wait for confirmation.
///
/// Returns `true` without asking when no terminal is attached.
pub fn confirm_start(root: &Path) -> io::Result<bool> {
    if !Term::stderr().is_term() {
        return Ok(true);
    }

    eprintln!(
        "This will download the prebuilt binaries and update files under {}.",
        style(root.display()).bold()
    );
    eprintln!("Locally modified files are never replaced without asking.");

    Confirm::new()
        .with_prompt("Continue?")
        .default(true)
        .interact()
        .map_err(io::Error::from)
}

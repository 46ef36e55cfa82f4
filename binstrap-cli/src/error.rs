//! CLI error type and exit codes.

use binstrap::BootstrapError;
use thiserror::Error;

/// Exit status for a user interrupt.
pub const EXIT_CANCELLED: u8 = 130;

/// Errors surfaced to the user by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// Problem with the environment before any work started.
    #[error("{0}")]
    Setup(String),

    /// The user declined the confirmation prompt.
    #[error("nothing changed")]
    Declined,
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Bootstrap(BootstrapError::Cancelled) | Self::Declined => EXIT_CANCELLED,
            Self::Bootstrap(_) | Self::Setup(_) => 1,
        }
    }

    /// Whether running again continues from the state left on disk.
    pub fn resumable(&self) -> bool {
        match self {
            Self::Bootstrap(e) => e.resumable(),
            Self::Setup(_) | Self::Declined => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::from(BootstrapError::Cancelled).exit_code(), EXIT_CANCELLED);
        assert_eq!(CliError::Declined.exit_code(), EXIT_CANCELLED);
        assert_eq!(CliError::Setup("no root".into()).exit_code(), 1);

        let mismatch = BootstrapError::ChecksumMismatch {
            url: "https://mirror.test/a.zip".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        let err = CliError::from(mismatch);
        assert_eq!(err.exit_code(), 1);
        assert!(!err.resumable());
    }
}

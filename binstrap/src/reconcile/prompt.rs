//! Overwrite prompts for files the user changed locally.

use std::io;
use std::path::Path;

/// How conflicts are resolved without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserPolicy {
    /// Ask for every conflicting file.
    #[default]
    Ask,
    /// Overwrite every conflicting file.
    AssumeMove,
    /// Keep every conflicting file.
    AssumeSkip,
}

/// What to do with one conflicting file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Replace the local file with the downloaded one.
    Move,
    /// Leave the local file alone.
    Skip,
}

/// A parsed prompt answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    YesAll,
    No,
    NoAll,
}

impl Answer {
    /// Parse `y`, `yes`, `yes all`, `n`, `no`, `no all`, ignoring case and
    /// surrounding whitespace.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        match normalized.as_str() {
            "y" | "yes" => Some(Self::Yes),
            "yes all" => Some(Self::YesAll),
            "n" | "no" => Some(Self::No),
            "no all" => Some(Self::NoAll),
            _ => None,
        }
    }

    pub fn resolution(self) -> Resolution {
        match self {
            Self::Yes | Self::YesAll => Resolution::Move,
            Self::No | Self::NoAll => Resolution::Skip,
        }
    }

    /// Policy for the rest of the run, if this answer changes it.
    pub fn upgraded_policy(self) -> Option<UserPolicy> {
        match self {
            Self::YesAll => Some(UserPolicy::AssumeMove),
            Self::NoAll => Some(UserPolicy::AssumeSkip),
            Self::Yes | Self::No => None,
        }
    }
}

/// Source of answers for conflicting files.
///
/// Only ever called from the thread running reconciliation.
pub trait ConflictPrompt {
    /// Ask whether `path` may be overwritten and return the raw reply.
    fn ask(&mut self, path: &Path) -> io::Result<String>;
}

/// Prompt that never asks and answers according to a fixed policy.
#[derive(Debug, Clone, Copy)]
pub struct NoPrompt;

impl ConflictPrompt for NoPrompt {
    fn ask(&mut self, _path: &Path) -> io::Result<String> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interactive prompt unavailable",
        ))
    }
}

/// Replays canned answers in order, then fails.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPrompt {
    answers: std::collections::VecDeque<String>,
    pub asked: Vec<std::path::PathBuf>,
}

impl ScriptedPrompt {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            asked: Vec::new(),
        }
    }
}

impl ConflictPrompt for ScriptedPrompt {
    fn ask(&mut self, path: &Path) -> io::Result<String> {
        self.asked.push(path.to_path_buf());
        self.answers
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no more answers"))
    }
}

/// Resolves conflicts one at a time, tracking policy upgrades.
#[derive(Debug)]
pub struct ConflictResolver<'p, P: ConflictPrompt + ?Sized> {
    policy: UserPolicy,
    prompt: &'p mut P,
}

/// Invalid replies tolerated for one file before it is skipped.
const MAX_INVALID_REPLIES: usize = 5;

impl<'p, P: ConflictPrompt + ?Sized> ConflictResolver<'p, P> {
    pub fn new(policy: UserPolicy, prompt: &'p mut P) -> Self {
        Self { policy, prompt }
    }

    pub fn policy(&self) -> UserPolicy {
        self.policy
    }

    /// Decide what happens to the conflicting file at `path`.
    ///
    /// A prompt that cannot be answered keeps the local file and switches
    /// to skipping for the rest of the run.
    pub fn resolve(&mut self, path: &Path) -> Resolution {
        match self.policy {
            UserPolicy::AssumeMove => return Resolution::Move,
            UserPolicy::AssumeSkip => return Resolution::Skip,
            UserPolicy::Ask => {}
        }

        for _ in 0..MAX_INVALID_REPLIES {
            let reply = match self.prompt.ask(path) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Prompt failed, keeping local files");
                    self.policy = UserPolicy::AssumeSkip;
                    return Resolution::Skip;
                }
            };

            if let Some(answer) = Answer::parse(&reply) {
                if let Some(policy) = answer.upgraded_policy() {
                    self.policy = policy;
                }
                return answer.resolution();
            }
        }

        tracing::warn!(path = %path.display(), "No valid answer, keeping local file");
        Resolution::Skip
    }
}

//! Error taxonomy surfaced at the command boundary.
//!
//! Orchestration code returns `anyhow::Result`; these variants travel inside
//! `anyhow::Error` and are recovered with `downcast_ref::<EmError>()` when a
//! caller needs to branch on the kind of failure.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmError {
    #[error("\"{}\" is not a project directory", .0.display())]
    NotAProject(PathBuf),

    #[error("no experiment named \"{0}\"")]
    NoSuchExperiment(String),

    #[error("experiment named \"{0}\" already exists")]
    NameAlreadyExists(String),

    #[error("experiment \"{0}\" is already running")]
    AlreadyRunning(String),

    #[error("experiment \"{0}\" is not running")]
    NotRunning(String),

    #[error("branch \"{0}\" already exists")]
    BranchConflict(String),

    #[error("cannot run experiment on checked out branch \"{0}\"")]
    CheckedOutConflict(String),

    #[error("not updating existing branch \"{0}\" with source changes")]
    DirtySourceConflict(String),

    #[error("could not move experiment directory {} -> {}", from.display(), to.display())]
    FilesystemMoveFailure {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("git {command} failed: {stderr}")]
    VcsOperationFailure { command: String, stderr: String },

    #[error("experiment \"{name}\" is not running on this machine ({reason})")]
    StaleRecord { name: String, reason: String },

    #[error("invalid experiment name \"{name}\": {reason}")]
    InvalidName { name: String, reason: String },
}

impl EmError {
    pub fn vcs(args: &[&str], stderr: impl Into<String>) -> Self {
        Self::VcsOperationFailure {
            command: args.join(" "),
            stderr: stderr.into(),
        }
    }
}

/// Find the taxonomy error inside an `anyhow` chain, if any.
pub fn classify(err: &anyhow::Error) -> Option<&EmError> {
    err.chain().find_map(|cause| cause.downcast_ref::<EmError>())
}

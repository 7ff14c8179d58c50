//! Typed failure taxonomy shared by the planner, console, and build pipeline.
//!
//! Orchestration code wraps these in `anyhow` for context; the CLI downcasts
//! back to [`ProvisionError`] to choose an exit code.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A partition-plan or configuration invariant was violated. Raised before
    /// any side effect.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Expected console output never arrived.
    #[error("timed out after {timeout:?} waiting for /{pattern}/ (last output: {tail:?})")]
    PatternTimeout {
        pattern: String,
        timeout: Duration,
        tail: String,
    },

    #[error("console closed while waiting for /{pattern}/ (last output: {tail:?})")]
    ConsoleClosed { pattern: String, tail: String },

    #[error("invalid console pattern /{pattern}/: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The persisted build-state record could not be read or written.
    #[error("build state record {} unusable: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },

    /// An invoked build or version-control tool exited unsuccessfully.
    #[error("`{command}` failed: {status}")]
    ExternalTool { command: String, status: String },

    #[error("artifact {name}: {reason}")]
    Artifact { name: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

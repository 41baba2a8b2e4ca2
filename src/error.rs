//! Diagnostic error types for tunnel supervision and the files behind it.
//!
//! Core operations return [`TunnelError`] so callers can match on the failure
//! class; the CLI converts everything into `miette::Report` for rendering.

// False positive: fields are used in #[error] format strings and miette derive macros
#![allow(unused_assignments)]

use crate::tunnel_status::TunnelStatus;
use miette::{Diagnostic, NamedSource, SourceSpan};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type TunnelResult<T> = std::result::Result<T, TunnelError>;

/// Failures of registry and supervisor operations.
#[derive(Debug, Error, Diagnostic)]
pub enum TunnelError {
    #[error("tunnel '{id}' is invalid: {reason}")]
    #[diagnostic(
        code(tunnelman::tunnel::invalid),
        help("fix the tunnel definition in tunnels.toml or with `tunnelman update`")
    )]
    Validation { id: String, reason: String },

    #[error("failed to start ssh for tunnel '{id}'")]
    #[diagnostic(
        code(tunnelman::tunnel::spawn_failed),
        help("check that the ssh client is installed or set TUNNELMAN_SSH_BIN")
    )]
    Spawn {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("could not signal process {pid} of tunnel '{id}': {details}")]
    #[diagnostic(
        code(tunnelman::tunnel::termination_failed),
        help("the process may belong to another user. Try: kill -9 {pid}")
    )]
    Termination { id: String, pid: u32, details: String },

    #[error("tunnel '{id}' is already {status}")]
    #[diagnostic(code(tunnelman::tunnel::already_active))]
    AlreadyActive { id: String, status: TunnelStatus },

    #[error("tunnel '{id}' is running")]
    #[diagnostic(
        code(tunnelman::tunnel::busy),
        help("stop it first: tunnelman stop {id}")
    )]
    Busy { id: String },

    #[error("tunnel '{id}' not found")]
    #[diagnostic(code(tunnelman::tunnel::not_found))]
    NotFound {
        id: String,
        #[help]
        suggestion: Option<String>,
    },

    #[error("tunnel '{id}' is not running")]
    #[diagnostic(code(tunnelman::tunnel::not_running))]
    NotRunning { id: String },

    #[error("failed to persist tunnel state")]
    #[diagnostic(code(tunnelman::persistence))]
    Persistence {
        #[source]
        #[diagnostic_source]
        source: FileError,
    },

    #[error("failed to {operation} {} tunnel(s): {}", failed.len(), failed.join(", "))]
    #[diagnostic(
        code(tunnelman::batch_failed),
        help("run `tunnelman list` to see the last error of each tunnel")
    )]
    BatchFailed {
        operation: String,
        failed: Vec<String>,
    },

    #[error("deadline exceeded with {pending} tunnel(s) still stopping")]
    #[diagnostic(
        code(tunnelman::deadline_exceeded),
        help("the remaining processes are still being killed in the background")
    )]
    DeadlineExceeded { pending: usize },
}

impl TunnelError {
    pub fn validation(id: impl Into<String>, reason: impl Into<String>) -> Self {
        TunnelError::Validation {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// True for the "unknown id" and "not running" members of the not-found class.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TunnelError::NotFound { .. } | TunnelError::NotRunning { .. }
        )
    }
}

impl From<FileError> for TunnelError {
    fn from(source: FileError) -> Self {
        TunnelError::Persistence { source }
    }
}

/// Error for TOML parse failures with source code highlighting.
#[derive(Debug, Error, Diagnostic)]
#[error("failed to parse {}", src.name())]
#[diagnostic(code(tunnelman::config::parse_error))]
pub struct ConfigParseError {
    #[source_code]
    pub src: NamedSource<String>,

    #[label("{message}")]
    pub span: SourceSpan,

    pub message: String,

    #[help]
    pub help: Option<String>,
}

impl ConfigParseError {
    pub fn from_toml_error(path: &std::path::Path, contents: String, err: toml::de::Error) -> Self {
        let message = err.message().to_string();
        let span = err
            .span()
            .map(|r| SourceSpan::from(r.start..r.end))
            .unwrap_or_else(|| SourceSpan::from(0..0));

        Self {
            src: NamedSource::new(path.display().to_string(), contents),
            span,
            message,
            help: Some("check TOML syntax at https://toml.io".to_string()),
        }
    }
}

/// Errors related to file operations (tunnel config and pid ledger).
#[derive(Debug, Error, Diagnostic)]
pub enum FileError {
    #[error("failed to read file: {}", path.display())]
    #[diagnostic(code(tunnelman::file::read_error))]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write file: {}", path.display())]
    #[diagnostic(code(tunnelman::file::write_error))]
    WriteError {
        path: PathBuf,
        #[help]
        details: Option<String>,
    },

    #[error("failed to serialize data for file: {}", path.display())]
    #[diagnostic(
        code(tunnelman::file::serialize_error),
        help("this is likely an internal error; please report it")
    )]
    SerializeError {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },

    #[error("refusing to write tunnel '{id}' to {}: {reason}", path.display())]
    #[diagnostic(code(tunnelman::file::invalid_entry))]
    InvalidEntry {
        path: PathBuf,
        id: String,
        reason: String,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(Box<ConfigParseError>),
}

/// `err` followed by its chain of causes.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

/// Find the most similar tunnel id for suggestions.
pub fn find_similar_tunnel<'a>(
    name: &str,
    available: impl Iterator<Item = &'a str>,
) -> Option<String> {
    use fuzzy_matcher::FuzzyMatcher;
    use fuzzy_matcher::skim::SkimMatcherV2;

    let matcher = SkimMatcherV2::default();
    available
        .filter_map(|candidate| {
            matcher
                .fuzzy_match(candidate, name)
                .map(|score| (candidate, score))
        })
        .max_by_key(|(_, score)| *score)
        .filter(|(_, score)| *score > 0)
        .map(|(candidate, _)| format!("did you mean '{candidate}'?"))
}

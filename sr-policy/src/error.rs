use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Failures while loading or validating the policy document.
#[derive(Error, Diagnostic, Debug)]
pub enum PolicyError {
    #[error("policy file {0} does not exist")]
    Missing(PathBuf),

    #[error("cannot read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("policy file {path} is not valid: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("policy file {path}: {element}: {detail}")]
    #[diagnostic(help("fix the named element and reload"))]
    Validation {
        path: PathBuf,
        /// First offending element, named for the operator.
        element: String,
        detail: String,
    },

    #[error("policy file {path} must be owned by root with mode 0644 or stricter (found uid {uid}, mode {mode:o})")]
    Permissions { path: PathBuf, uid: u32, mode: u32 },
}

/// Failures while selecting a (role, task) pair for an invocation.
#[derive(Error, Diagnostic, Debug)]
pub enum MatchError {
    #[error("role {0} does not exist")]
    RoleUnknown(String),

    /// Deliberately does not say whether the actor or the command failed to
    /// match.
    #[error("permission denied")]
    PermissionDenied,

    #[error("ambiguous match: {}", .0.join(", "))]
    #[diagnostic(help("disambiguate the policy or request a role with -r"))]
    Ambiguous(Vec<String>),
}

/// Failures while canonicalising the requested command.
#[derive(Error, Diagnostic, Debug)]
pub enum CommandError {
    #[error("no command given")]
    Empty,

    #[error("{0}: command not found ({1})")]
    NotFound(String, String),

    #[error("{0} is not executable")]
    NotExecutable(PathBuf),

    #[error("empty command pattern")]
    EmptyPattern,

    #[error("command pattern {0:?} must start with / or a wildcard")]
    RelativePattern(String),

    #[error("bad glob {0:?}: {1}")]
    BadGlob(String, String),

    #[error("bad argument regex {0:?}: {1}")]
    BadRegex(String, String),
}

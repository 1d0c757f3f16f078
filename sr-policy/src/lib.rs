//! Policy engine for the `sr` privilege tool.
//!
//! The crate owns everything that can be decided without touching process
//! state: loading and validating the on-disk role document, canonicalising
//! the requested command, selecting the unique least-privileged (role, task)
//! pair for an invocation, and computing the environment the child process
//! will receive. The privileged side (capability sets, fork/exec) lives in
//! `sr-caps`.

pub mod command;
pub mod env;
pub mod error;
pub mod matcher;
pub mod model;
pub mod store;

pub use command::{CommandLine, CommandPattern, PatternClass};
pub use error::{MatchError, PolicyError};
pub use matcher::{MatchOutcome, MatchRequest, Settings};
pub use model::{Policy, Role, RoleId, Task, TaskId};

/// Default location of the policy document. Overridable at build time so
/// packagers can relocate it.
pub const POLICY_FILE: &str = match option_env!("SR_POLICY_FILE") {
    Some(path) => path,
    None => "/etc/security/rootasrole.xml",
};

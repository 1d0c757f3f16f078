//! Credential verification for the invoker.
//!
//! Full PAM integration is a collaborator, not part of this crate; the
//! launcher only needs a yes/no/error answer. The shipped implementation
//! probes the system's cached sudo credentials non-interactively and falls
//! back to an interactive refresh, so an unattended `sr` never silently
//! elevates a cold session.

use std::process::{Command, Stdio};

use tracing::debug;

#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    Fail,
    Error(String),
}

/// An external credential check for a user.
pub trait CredentialCheck {
    fn verify(&self, user: &str) -> AuthOutcome;
}

/// Checks against the system's credential cache via `sudo -v`.
pub struct CachedCredentialCheck;

impl CredentialCheck for CachedCredentialCheck {
    fn verify(&self, user: &str) -> AuthOutcome {
        debug!(user, "verifying credentials");

        // Non-interactive probe first.
        match Command::new("sudo")
            .args(["-n", "-v"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return AuthOutcome::Ok,
            Ok(_) => {}
            Err(e) => return AuthOutcome::Error(e.to_string()),
        }

        // Credentials not cached: let the user type a password.
        match Command::new("sudo")
            .arg("-v")
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
        {
            Ok(status) if status.success() => AuthOutcome::Ok,
            Ok(_) => AuthOutcome::Fail,
            Err(e) => AuthOutcome::Error(e.to_string()),
        }
    }
}

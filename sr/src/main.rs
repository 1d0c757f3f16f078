mod auth;
mod cli;
mod identity;
mod info;

use std::path::PathBuf;

use capctl::caps::Cap;
use clap::Parser;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sr_caps::launcher::{launch, Iab, LaunchError, LaunchRequest};
use sr_policy::error::{CommandError, MatchError, PolicyError};
use sr_policy::matcher::{find_task, MatchRequest};
use sr_policy::{env as env_filter, store, CommandLine};

use auth::{AuthOutcome, CachedCredentialCheck, CredentialCheck};
use cli::Cli;
use identity::IdentityError;

/// The installed helper executable the launcher copies and stamps.
const SR_AUX_SOURCE: &str = match option_env!("SR_AUX_SOURCE") {
    Some(path) => path,
    None => "/usr/libexec/sr_aux",
};

/// Transient helper location when the session changes user.
const SYSTEM_HELPER_DIR: &str = "/usr/bin";

#[derive(Error, Debug)]
enum SrError {
    #[error("{0}")]
    InvalidArgs(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("authentication failed")]
    AuthFailed,

    #[error("authentication error: {0}")]
    AuthError(String),

    #[error("cannot execute as root: the policy enforces the no-root protection (use -n)")]
    RootForbidden,

    #[error("cannot switch user: cap_setuid and cap_setgid are not in the effective set")]
    SetuidNotPermitted,

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl SrError {
    fn exit_code(&self) -> i32 {
        match self {
            SrError::InvalidArgs(_) => 2,
            SrError::Policy(_) => 3,
            SrError::Match(MatchError::RoleUnknown(_)) => 4,
            SrError::Match(MatchError::PermissionDenied) => 5,
            SrError::Match(MatchError::Ambiguous(_)) => 6,
            SrError::AuthFailed | SrError::AuthError(_) => 5,
            SrError::RootForbidden | SrError::SetuidNotPermitted => 5,
            SrError::Command(_) | SrError::Identity(_) | SrError::Launch(_) => 1,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sr: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn run(cli: &Cli) -> Result<i32, SrError> {
    let invoker = identity::current_invoker()?;
    debug!(user = invoker.name.as_str(), uid = invoker.uid, "resolved invoker");

    // `-u` is reserved to processes that can already change identity.
    if cli.user.is_some() {
        let can_switch = sr_caps::caps::effective_has(Cap::SETUID).unwrap_or(false)
            && sr_caps::caps::effective_has(Cap::SETGID).unwrap_or(false);
        if !can_switch {
            return Err(SrError::SetuidNotPermitted);
        }
    } else if invoker.uid != 0 {
        match CachedCredentialCheck.verify(&invoker.name) {
            AuthOutcome::Ok => {}
            AuthOutcome::Fail => return Err(SrError::AuthFailed),
            AuthOutcome::Error(e) => return Err(SrError::AuthError(e)),
        }
    }

    let policy = store::load(std::path::Path::new(sr_policy::POLICY_FILE))?;

    if cli.info {
        info::print_rights(&policy, &invoker, cli.role.as_deref());
        return Ok(0);
    }

    // An explicit command is shell-word-split before matching; an
    // interactive session is matched as the invoker's login shell.
    let interactive = cli.command.is_none();
    let argv = match &cli.command {
        Some(raw) => {
            let words = shell_words::split(raw)
                .map_err(|e| SrError::InvalidArgs(format!("bad command string: {e}")))?;
            if words.is_empty() {
                return Err(SrError::InvalidArgs("empty command string".to_string()));
            }
            words
        }
        None => {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            vec![shell]
        }
    };

    let command = CommandLine::from_argv(&argv)?;
    let mut canonical_argv = vec![command.path.display().to_string()];
    canonical_argv.extend(command.args.iter().cloned());

    let outcome = find_task(
        &policy,
        &MatchRequest {
            invoker_uid: invoker.uid,
            user: &invoker.name,
            groups: &invoker.groups,
            role: cli.role.as_deref(),
            command: &command,
        },
    )?;
    let settings = outcome.settings;
    info!(role = settings.role_name.as_str(), command = %command.joined(), "matched");

    let target = identity::resolve_target(
        cli.user.as_deref(),
        settings.target_user.as_ref(),
        &settings.target_groups,
        &invoker,
    )?;

    // Root sessions need either an explicit policy opt-out or the forced
    // no-root protection.
    let target_uid = target.as_ref().map(|t| t.uid).unwrap_or(invoker.uid);
    if target_uid == 0 && settings.no_root && !cli.no_root {
        return Err(SrError::RootForbidden);
    }

    let invoker_env: Vec<(String, String)> = std::env::vars().collect();
    let child_env = env_filter::filter_env(
        &invoker_env,
        &settings.env_keep,
        &settings.env_check,
        &settings.path,
    );

    let changes_user = target.as_ref().is_some_and(|t| t.uid != invoker.uid);
    let helper_dir = if changes_user {
        PathBuf::from(SYSTEM_HELPER_DIR)
    } else {
        invoker.home.clone()
    };

    let request = LaunchRequest {
        iab: Iab::plan(settings.caps, settings.bounding),
        no_root: settings.no_root || cli.no_root,
        target,
        env: child_env,
        role_name: settings.role_name.clone(),
        command: if interactive { Vec::new() } else { canonical_argv },
        helper_source: PathBuf::from(SR_AUX_SOURCE),
        helper_dir,
    };

    let code = launch(&request)?;
    info!(role = settings.role_name.as_str(), code, "session ended");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_contract() {
        assert_eq!(SrError::InvalidArgs("x".into()).exit_code(), 2);
        assert_eq!(
            SrError::Policy(PolicyError::Missing("/etc/x".into())).exit_code(),
            3
        );
        assert_eq!(
            SrError::Match(MatchError::RoleUnknown("w".into())).exit_code(),
            4
        );
        assert_eq!(SrError::Match(MatchError::PermissionDenied).exit_code(), 5);
        assert_eq!(
            SrError::Match(MatchError::Ambiguous(vec!["a".into(), "b".into()])).exit_code(),
            6
        );
        assert_eq!(SrError::AuthFailed.exit_code(), 5);
        assert_eq!(SrError::RootForbidden.exit_code(), 5);
    }
}

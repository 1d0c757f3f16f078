use clap::Parser;

/// Run a command under a role: a named bundle of Linux capabilities, an
/// optional target identity, and an allowed-command policy.
#[derive(Debug, Parser)]
#[command(
    name = "sr",
    about = "Execute a command with the exact privileges of a role, and nothing more",
    disable_version_flag = true
)]
pub struct Cli {
    /// Role to use; without it every role is searched for the best match.
    #[arg(short, long)]
    pub role: Option<String>,

    /// Execute as this user (requires CAP_SETUID and CAP_SETGID).
    #[arg(short, long)]
    pub user: Option<String>,

    /// Command to run instead of an interactive shell.
    #[arg(short, long)]
    pub command: Option<String>,

    /// Force the no-root protection on, even where the policy disables it.
    #[arg(short, long)]
    pub no_root: bool,

    /// Print the commands available with the chosen role and exit.
    #[arg(short, long)]
    pub info: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,
}

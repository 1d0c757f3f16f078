//! capable — observe which capabilities a workload actually requests.
//!
//! A kprobe on the kernel's capability-check entry point aggregates one
//! bitmask per pid while the target runs; this driver spawns the target,
//! waits out the observation window, drains the maps once and renders the
//! report. Roles for `sr` are authored from its output.

mod aggregate;
mod collector;
mod event;
mod proc;
mod report;

use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use miette::{miette, IntoDiagnostic, Result, WrapErr};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use collector::{CapabilityEvents, KprobeCollector, DEFAULT_BPF_OBJECT};

#[derive(Debug, Parser)]
#[command(
    name = "capable",
    about = "Report the Linux capabilities programs ask the kernel for",
    disable_version_flag = true
)]
struct Cli {
    /// Command to run and observe (shell syntax).
    #[arg(short, long)]
    command: Option<String>,

    /// Observe for this many seconds, then report.
    #[arg(short, long, value_name = "SEC")]
    sleep: Option<u64>,

    /// Daemon mode: aggregate system-wide until interrupted.
    #[arg(short, long)]
    daemon: bool,

    /// Send SIGINT to the target before collecting.
    #[arg(short, long)]
    kill: bool,

    /// Aggregate per pid namespace instead of per pid.
    #[arg(short, long)]
    namespace: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.command.is_none() && !cli.daemon && cli.sleep.is_none() {
        return Err(miette!("nothing to observe: give -c, -s or -d"));
    }

    let object = std::env::var("CAPABLE_BPF_OBJECT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_BPF_OBJECT));
    let mut collector = KprobeCollector::attach(&object).into_diagnostic()?;

    // Interruption drains once, reports and exits 0.
    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
        .into_diagnostic()?;

    let mut target = match &cli.command {
        Some(command) => Some(spawn_target(command)?),
        None => None,
    };

    observe(&cli, target.as_mut(), &interrupted);

    if cli.kill {
        if let Some(child) = &target {
            debug!(pid = child.id(), "interrupting target");
            let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGINT);
        }
    }
    if let Some(child) = &mut target {
        // Reap so the report's name decoding sees a settled /proc.
        let _ = child.wait();
    }

    // One drain; per-entry consistency is all the kernel guarantees and all
    // an advisory report needs.
    let samples = collector.snapshot().into_diagnostic()?;
    debug!(count = samples.len(), "drained samples");

    if cli.namespace {
        report::print_namespace_table(&aggregate::by_namespace(&samples)).into_diagnostic()?;
    } else {
        report::print_pid_table(&aggregate::by_pid(&samples)).into_diagnostic()?;
    }
    Ok(())
}

/// Run the target under `sh -c`, so pipelines and redirections behave the
/// way the operator typed them.
fn spawn_target(command: &str) -> Result<Child> {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .spawn()
        .into_diagnostic()
        .wrap_err_with(|| format!("cannot spawn {command:?}"))
}

/// Block until the observation window closes: the fixed duration when `-s`
/// is given, otherwise target exit, otherwise interruption.
fn observe(cli: &Cli, mut target: Option<&mut Child>, interrupted: &Arc<AtomicBool>) {
    let deadline = cli.sleep.map(|s| Instant::now() + Duration::from_secs(s));
    let poll = Duration::from_millis(100);

    loop {
        if interrupted.load(Ordering::Relaxed) {
            debug!("interrupted; collecting");
            return;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return;
            }
        }
        if let Some(child) = target.as_deref_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "target exited");
                    // With a fixed window, keep observing descendants until
                    // the deadline.
                    if deadline.is_none() {
                        return;
                    }
                    target = None;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "cannot poll target");
                    return;
                }
            }
        } else if deadline.is_none() && !cli.daemon {
            // Nothing left to wait for.
            return;
        }
        std::thread::sleep(poll);
    }
}

//! The privileged launcher.
//!
//! Given resolved settings, the launcher stamps a transient copy of the
//! `sr_aux` helper with the task's permitted file capabilities, forks, seals
//! securebits and switches identity in the child, and execs the helper with
//! the settings on an inherited pipe. The parent shields itself from
//! terminal signals, waits, forwards the child's exit status and removes the
//! transient file.

use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use capctl::caps::{Cap, CapSet};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use rustix::process::{Gid, Uid};
use rustix::thread::{set_thread_groups, set_thread_res_gid, set_thread_res_uid};
use thiserror::Error;
use tracing::warn;

use crate::caps::{self, CapError};
use crate::protocol::{self, ApplySpec};

/// Signals held off the parent while the child runs, so a `^C` reaches the
/// session only.
const SHIELDED_SIGNALS: &[Signal] = &[
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGABRT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGTSTP,
];

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error(transparent)]
    Cap(#[from] CapError),

    #[error("cannot create transient helper in {dir}: {source}")]
    HelperCreate {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot read helper source {path}: {source}")]
    HelperSource {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("launch setup failed: {0}")]
    Setup(String),

    #[error("fork failed: {0}")]
    Fork(std::io::Error),

    #[error("wait failed: {0}")]
    Wait(String),
}

/// The (Inheritable, Ambient, Bounding) triple applied to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iab {
    pub inheritable: CapSet,
    pub ambient: CapSet,
    pub bounding: CapSet,
}

impl Iab {
    /// Plan the triple for a task grant: `A = I = caps`; `B = caps` when the
    /// bounding option is enforced, the full kernel set otherwise.
    pub fn plan(caps_set: CapSet, restrict_bounding: bool) -> Iab {
        Iab {
            inheritable: caps_set,
            ambient: caps_set,
            bounding: if restrict_bounding {
                caps_set
            } else {
                caps::supported()
            },
        }
    }

    /// `A ⊆ I` and, when bounding is restricted, `B ⊆ I`.
    pub fn is_coherent(&self) -> bool {
        (self.ambient & !self.inheritable).is_empty()
            && (self.bounding == caps::supported()
                || (self.bounding & !self.inheritable).is_empty())
    }
}

/// Target identity, fully resolved to ids by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetIds {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

#[derive(Debug)]
pub struct LaunchRequest {
    pub iab: Iab,
    pub no_root: bool,
    /// `None` keeps the invoker's identity.
    pub target: Option<TargetIds>,
    /// Filtered environment including the secure `PATH`.
    pub env: Vec<(String, String)>,
    pub role_name: String,
    /// Empty argv means an interactive shell.
    pub command: Vec<String>,
    /// The installed helper executable to copy and stamp.
    pub helper_source: PathBuf,
    /// Where the transient copy lives: the invoker's home, or `/usr/bin`
    /// when switching user.
    pub helper_dir: PathBuf,
}

/// Run the request to completion and return the exit code to forward.
pub fn launch(request: &LaunchRequest) -> Result<i32, LaunchError> {
    if !request.iab.is_coherent() {
        return Err(LaunchError::Setup(
            "planned capability sets are incoherent".to_string(),
        ));
    }

    let spec = ApplySpec {
        inheritable: protocol::caps_to_names(request.iab.inheritable),
        ambient: protocol::caps_to_names(request.iab.ambient),
        bounding: (request.iab.bounding != caps::supported())
            .then(|| protocol::caps_to_names(request.iab.bounding)),
        no_root: request.no_root,
        env: request.env.clone(),
        role: request.role_name.clone(),
        command: request.command.clone(),
    };

    // The helper regains its permitted set from the file capabilities at
    // exec; SETPCAP rides along so it can narrow the bounding set, and is
    // dropped again before the final exec.
    let mut file_caps = request.iab.inheritable;
    file_caps.add(Cap::SETPCAP);
    let helper = TransientHelper::create(&request.helper_source, &request.helper_dir, file_caps)?;

    // The frame is written before the fork; a pipe buffer comfortably holds
    // it, and the child only ever reads.
    let (read_end, write_end) = rustix::pipe::pipe()
        .map_err(|e| LaunchError::Setup(format!("pipe: {e}")))?;
    {
        let mut writer = std::fs::File::from(write_end);
        protocol::write_frame(&mut writer, &spec)
            .map_err(|e| LaunchError::Setup(format!("settings frame: {e}")))?;
    }

    match unsafe { libc::fork() } {
        -1 => Err(LaunchError::Fork(std::io::Error::last_os_error())),

        0 => {
            // Child. Never returns.
            child_setup_and_exec(request, helper.path(), read_end.as_raw_fd());
        }

        pid => {
            drop(read_end);
            let _shield = SignalShield::engage();
            let status = wait_for_child(pid);
            // helper (and its transient file) dropped here, after the child
            // is gone.
            status
        }
    }
}

/// Child-side work between fork and exec. Any failure is fatal with exit
/// code 1; the parent forwards it.
fn child_setup_and_exec(request: &LaunchRequest, helper_path: &Path, frame_fd: i32) -> ! {
    if let Err(e) = child_setup(request, helper_path, frame_fd) {
        eprintln!("sr: {e}");
        std::process::exit(1);
    }
    unreachable!("exec does not return");
}

fn child_setup(
    request: &LaunchRequest,
    helper_path: &Path,
    frame_fd: i32,
) -> Result<(), LaunchError> {
    // Securebits first: they change setuid semantics, so they must be sealed
    // before any identity change.
    if request.no_root {
        caps::lock_noroot_securebits()?;
    }

    // The inheritable set survives execve and the uid change; it must be in
    // place before setuid clears effective and ambient.
    caps::set_inheritable(request.iab.inheritable)?;

    if let Some(target) = &request.target {
        let groups: Vec<Gid> = target.groups.iter().map(|&g| Gid::from_raw(g)).collect();
        let gid = Gid::from_raw(target.gid);
        let uid = Uid::from_raw(target.uid);

        set_thread_groups(&groups)
            .map_err(|e| LaunchError::Setup(format!("setgroups: {e}")))?;
        set_thread_res_gid(gid, gid, gid)
            .map_err(|e| LaunchError::Setup(format!("setresgid: {e}")))?;
        set_thread_res_uid(uid, uid, uid)
            .map_err(|e| LaunchError::Setup(format!("setresuid: {e}")))?;
    }

    exec_helper(helper_path, frame_fd)
}

/// Exec the stamped helper with the settings pipe as its only input.
fn exec_helper(helper_path: &Path, frame_fd: i32) -> Result<(), LaunchError> {
    use std::ffi::CString;

    let path = CString::new(helper_path.as_os_str().as_encoded_bytes())
        .map_err(|_| LaunchError::Setup("helper path contains a null byte".to_string()))?;
    let fd_arg = CString::new(frame_fd.to_string()).expect("fd digits");
    let flag = CString::new("--fd").expect("static");

    let argv: [*const libc::c_char; 4] = [
        path.as_ptr(),
        flag.as_ptr(),
        fd_arg.as_ptr(),
        std::ptr::null(),
    ];
    // The helper builds the child environment from the settings frame.
    let envp: [*const libc::c_char; 1] = [std::ptr::null()];

    unsafe {
        libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    Err(LaunchError::Setup(format!(
        "execve({}): {}",
        helper_path.display(),
        std::io::Error::last_os_error()
    )))
}

fn wait_for_child(pid: libc::pid_t) -> Result<i32, LaunchError> {
    let child = Pid::from_raw(pid);
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(LaunchError::Wait(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Transient helper file
// ---------------------------------------------------------------------------

/// A stamped copy of `sr_aux`, removed on drop. Crash before cleanup leaves
/// a file that carries file capabilities but is executable by the invoker
/// alone; the residual risk is accepted and documented.
struct TransientHelper {
    path: PathBuf,
}

impl TransientHelper {
    fn create(source: &Path, dir: &Path, file_caps: CapSet) -> Result<Self, LaunchError> {
        let bytes = std::fs::read(source).map_err(|source_err| LaunchError::HelperSource {
            path: source.to_path_buf(),
            source: source_err,
        })?;

        let mut file = tempfile::Builder::new()
            .prefix("sr_aux_")
            .rand_bytes(6)
            .tempfile_in(dir)
            .map_err(|source| LaunchError::HelperCreate {
                dir: dir.to_path_buf(),
                source,
            })?;
        file.write_all(&bytes)
            .map_err(|source| LaunchError::HelperCreate {
                dir: dir.to_path_buf(),
                source,
            })?;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o700))
            .map_err(|source| LaunchError::HelperCreate {
                dir: dir.to_path_buf(),
                source,
            })?;

        // Detach from tempfile's own deletion; the guard owns cleanup from
        // here so the file survives exactly as long as the launch.
        let (_, path) = file
            .keep()
            .map_err(|e| LaunchError::HelperCreate {
                dir: dir.to_path_buf(),
                source: e.error,
            })?;

        caps::file_set_permitted(&path, file_caps).inspect_err(|_| {
            let _ = std::fs::remove_file(&path);
        })?;

        Ok(TransientHelper { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransientHelper {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            // Non-fatal: the session already ran; report and move on.
            warn!(path = %self.path.display(), error = %e, "could not remove transient helper");
        }
    }
}

// ---------------------------------------------------------------------------
// Parent signal shield
// ---------------------------------------------------------------------------

/// Ignores the terminal signals for the guard's lifetime and restores the
/// previous dispositions on drop.
struct SignalShield {
    saved: Vec<(Signal, SigAction)>,
}

impl SignalShield {
    fn engage() -> SignalShield {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::SA_RESTART, SigSet::empty());
        let mut saved = Vec::with_capacity(SHIELDED_SIGNALS.len());
        for &signal in SHIELDED_SIGNALS {
            // SAFETY: replacing dispositions with SIG_IGN is async-signal-safe.
            match unsafe { sigaction(signal, &ignore) } {
                Ok(old) => saved.push((signal, old)),
                Err(e) => warn!(%signal, error = %e, "cannot shield signal"),
            }
        }
        SignalShield { saved }
    }
}

impl Drop for SignalShield {
    fn drop(&mut self) {
        for (signal, old) in self.saved.drain(..) {
            // SAFETY: restoring the previously saved disposition.
            if let Err(e) = unsafe { sigaction(signal, &old) } {
                warn!(%signal, error = %e, "cannot restore signal disposition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn capset(caps_list: &[Cap]) -> CapSet {
        let mut set = CapSet::empty();
        for &cap in caps_list {
            set.add(cap);
        }
        set
    }

    #[test]
    fn iab_plan_with_bounding() {
        let grant = capset(&[Cap::NET_BIND_SERVICE]);
        let iab = Iab::plan(grant, true);
        assert_eq!(iab.inheritable, grant);
        assert_eq!(iab.ambient, grant);
        assert_eq!(iab.bounding, grant);
        assert!(iab.is_coherent());
    }

    #[test]
    fn iab_plan_without_bounding_keeps_full_set() {
        let grant = capset(&[Cap::NET_BIND_SERVICE]);
        let iab = Iab::plan(grant, false);
        assert_eq!(iab.bounding, caps::supported());
        assert!(iab.is_coherent());
    }

    #[test]
    fn empty_grant_is_coherent() {
        let iab = Iab::plan(CapSet::empty(), true);
        assert!(iab.is_coherent());
        assert!(iab.ambient.is_empty());
    }

    #[test]
    fn ambient_outside_inheritable_is_incoherent() {
        let iab = Iab {
            inheritable: CapSet::empty(),
            ambient: capset(&[Cap::NET_RAW]),
            bounding: caps::supported(),
        };
        assert!(!iab.is_coherent());
    }

    #[test]
    fn transient_helper_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("sr_aux");
        std::fs::write(&source, b"#!/bin/sh\n").unwrap();

        let path;
        {
            // Stamping file caps needs privilege; create the file without
            // them to exercise the creation and cleanup paths.
            let bytes = std::fs::read(&source).unwrap();
            let mut file = tempfile::Builder::new()
                .prefix("sr_aux_")
                .rand_bytes(6)
                .tempfile_in(dir.path())
                .unwrap();
            file.write_all(&bytes).unwrap();
            let (_, kept) = file.keep().unwrap();
            path = kept.clone();
            let helper = TransientHelper { path: kept };
            assert!(helper.path().exists());
        }
        assert!(!path.exists());
    }
}

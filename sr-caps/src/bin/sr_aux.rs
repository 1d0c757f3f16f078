//! sr_aux
//!
//! The post-exec half of the launcher. It starts with the task's permitted
//! set repopulated from the file capabilities stamped on its transient copy,
//! reads the resolved settings from an inherited pipe, applies the
//! Inheritable/Ambient/Bounding triple, seals no-new-privs when asked, and
//! execs the session command with the filtered environment.
//!
//! Argument parsing is deliberately minimal: the only argv input is the
//! pipe fd, and nothing security-relevant comes from argv or the inherited
//! environment.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::FromRawFd;

use capctl::caps::Cap;

use sr_caps::caps;
use sr_caps::protocol::{self, ApplySpec};

fn main() {
    let fd = parse_fd_arg();

    // Validate before taking ownership.
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    if rustix::io::fcntl_getfd(borrowed).is_err() {
        eprintln!("sr_aux: --fd {fd} is not a valid file descriptor");
        std::process::exit(1);
    }
    let mut frame = unsafe { File::from_raw_fd(fd) };

    let spec = match protocol::read_frame(&mut frame) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("sr_aux: cannot read settings frame: {e}");
            std::process::exit(1);
        }
    };
    drop(frame);

    if let Err(e) = apply_and_exec(&spec) {
        eprintln!("sr_aux: {e}");
        std::process::exit(1);
    }
}

fn parse_fd_arg() -> i32 {
    let args: Vec<String> = std::env::args().collect();
    if args.len() == 3 && args[1] == "--fd" {
        if let Ok(fd) = args[2].parse::<i32>() {
            return fd;
        }
    }
    eprintln!("usage: sr_aux --fd N");
    std::process::exit(1);
}

fn apply_and_exec(spec: &ApplySpec) -> Result<(), String> {
    let inheritable = protocol::names_to_caps(&spec.inheritable)
        .map_err(|e| format!("inheritable set: {e}"))?;
    let ambient =
        protocol::names_to_caps(&spec.ambient).map_err(|e| format!("ambient set: {e}"))?;

    caps::set_inheritable(inheritable).map_err(|e| e.to_string())?;

    // One bit at a time; the kernel checks permitted ∩ inheritable per bit.
    caps::raise_ambient(ambient).map_err(|e| e.to_string())?;

    if let Some(bounding_names) = &spec.bounding {
        let bounding =
            protocol::names_to_caps(bounding_names).map_err(|e| format!("bounding set: {e}"))?;
        caps::restrict_bounding(bounding).map_err(|e| e.to_string())?;
    }

    // SETPCAP came from the file capabilities for the bounding restriction
    // only; it must not reach the session.
    caps::effective_set(Cap::SETPCAP, false).map_err(|e| e.to_string())?;

    if spec.no_root {
        caps::set_no_new_privs().map_err(|e| e.to_string())?;
    }

    exec_session(spec)
}

/// Build the final environment and exec the command, or an interactive
/// shell when none was given. Never returns on success.
fn exec_session(spec: &ApplySpec) -> Result<(), String> {
    let mut env = spec.env.clone();
    // The role prompt wins over anything the filter let through.
    env.retain(|(k, _)| k != "PS1" && k != "SR_ROLE");
    env.push(("SR_ROLE".to_string(), spec.role.clone()));
    env.push((
        "PS1".to_string(),
        format!("[{}] \\u@\\h:\\w\\$ ", spec.role),
    ));

    let argv: Vec<String> = if spec.command.is_empty() {
        let shell = env
            .iter()
            .find(|(k, _)| k == "SHELL")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| "/bin/sh".to_string());
        vec![shell, "-i".to_string()]
    } else {
        spec.command.clone()
    };

    let c_argv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<Result<_, _>>()
        .map_err(|_| "argument contains a null byte".to_string())?;

    let c_env: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")))
        .collect::<Result<_, _>>()
        .map_err(|_| "environment value contains a null byte".to_string())?;

    let argv_ptrs: Vec<*const libc::c_char> = c_argv
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let env_ptrs: Vec<*const libc::c_char> = c_env
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    unsafe {
        libc::execve(c_argv[0].as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr());
    }

    // execve only returns on error.
    Err(format!(
        "execve({}): {}",
        argv[0],
        std::io::Error::last_os_error()
    ))
}

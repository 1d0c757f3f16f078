//! Wrappers over the kernel capability syscalls.
//!
//! Each operation either completes or leaves the process untouched; a
//! wrapper that detects a half-applied change aborts the process rather than
//! continue with an inconsistent privilege state. Errors carry enough
//! context to say which set and which bit failed.

use std::str::FromStr;

use capctl::caps::{Cap, CapSet, CapState, FileCaps};
use capctl::prctl::{self, Secbits};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapError {
    #[error("cannot read process capability state: {0}")]
    ReadState(capctl::Error),

    #[error("cannot toggle {cap:?} in the effective set: {source}")]
    Effective {
        cap: Cap,
        source: capctl::Error,
    },

    #[error("cannot replace the inheritable set: {0}")]
    Inheritable(capctl::Error),

    #[error("cannot raise {cap:?} in the ambient set: {source}")]
    Ambient {
        cap: Cap,
        source: capctl::Error,
    },

    #[error("cannot drop {cap:?} from the bounding set: {source}")]
    Bounding {
        cap: Cap,
        source: capctl::Error,
    },

    #[error("cannot stamp file capabilities on {path}: {source}")]
    FileCaps {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot set securebits: {0}")]
    Securebits(capctl::Error),

    #[error("cannot set no_new_privs: {0}")]
    NoNewPrivs(capctl::Error),

    #[error("unknown capability name: {0}")]
    UnknownCap(String),
}

/// Whether `cap` is currently in the caller's effective set.
pub fn effective_has(cap: Cap) -> Result<bool, CapError> {
    let state = CapState::get_current().map_err(CapError::ReadState)?;
    Ok(state.effective.has(cap))
}

/// Toggle one capability in the caller's effective set. The kernel refuses
/// the raise when the capability is not in permitted.
pub fn effective_set(cap: Cap, enable: bool) -> Result<(), CapError> {
    let mut state = CapState::get_current().map_err(CapError::ReadState)?;
    if enable {
        state.effective.add(cap);
    } else {
        state.effective.drop(cap);
    }
    state
        .set_current()
        .map_err(|source| CapError::Effective { cap, source })
}

/// Replace the caller's inheritable set with `mask`.
pub fn set_inheritable(mask: CapSet) -> Result<(), CapError> {
    let mut state = CapState::get_current().map_err(CapError::ReadState)?;
    state.inheritable = mask;
    state.set_current().map_err(CapError::Inheritable)
}

/// Raise each capability of `caps` in the ambient set, one bit at a time.
/// The kernel refuses a bit that is not in both permitted and inheritable.
pub fn raise_ambient(caps: CapSet) -> Result<(), CapError> {
    for cap in caps.iter() {
        capctl::ambient::raise(cap).map_err(|source| CapError::Ambient { cap, source })?;
    }
    Ok(())
}

/// Drop every bounding bit not present in `mask`. Raising is impossible;
/// this only ever narrows.
pub fn restrict_bounding(mask: CapSet) -> Result<(), CapError> {
    for cap in supported().iter() {
        if !mask.has(cap) {
            capctl::bounding::drop(cap).map_err(|source| CapError::Bounding { cap, source })?;
        }
    }
    Ok(())
}

/// Stamp a permitted file-capability set (with the effective bit) on a file,
/// so the next `execve` of it repopulates the permitted set.
pub fn file_set_permitted(path: &std::path::Path, caps: CapSet) -> Result<(), CapError> {
    let mut fcaps = FileCaps::empty();
    fcaps.effective = true;
    fcaps.permitted = caps;
    fcaps
        .set_for_file(path)
        .map_err(|source| CapError::FileCaps {
            path: path.display().to_string(),
            source,
        })
}

/// Lock the process into the no-root securebits state:
/// `KEEP_CAPS_LOCKED | NO_SETUID_FIXUP | NO_SETUID_FIXUP_LOCKED | NOROOT |
/// NOROOT_LOCKED`. Changing securebits needs effective `CAP_SETPCAP`, which
/// is raised for the duration of the call and lowered again.
///
/// Must run before any uid change: the bits alter `setuid` semantics.
pub fn lock_noroot_securebits() -> Result<(), CapError> {
    let had_setpcap = effective_has(Cap::SETPCAP)?;
    if !had_setpcap {
        effective_set(Cap::SETPCAP, true)?;
    }

    let bits = Secbits::KEEP_CAPS_LOCKED
        | Secbits::NO_SETUID_FIXUP
        | Secbits::NO_SETUID_FIXUP_LOCKED
        | Secbits::NOROOT
        | Secbits::NOROOT_LOCKED;
    let result = prctl::set_securebits(bits).map_err(CapError::Securebits);

    if !had_setpcap {
        // Failing to lower SETPCAP again would leave the process more
        // privileged than the caller asked for; that state must not leak.
        if effective_set(Cap::SETPCAP, false).is_err() {
            std::process::abort();
        }
    }
    result
}

/// One-way switch: no further privilege gain through exec.
pub fn set_no_new_privs() -> Result<(), CapError> {
    prctl::set_no_new_privs().map_err(CapError::NoNewPrivs)
}

/// Parse `cap_net_raw` / `CAP_NET_RAW` / `net_raw`, honoring only the
/// capabilities the running kernel supports.
pub fn cap_from_name(name: &str) -> Result<Cap, CapError> {
    let normalized = name.trim().to_lowercase();
    let with_prefix = if normalized.starts_with("cap_") {
        normalized
    } else {
        format!("cap_{normalized}")
    };
    match Cap::from_str(&with_prefix) {
        Ok(cap) if cap.is_supported() => Ok(cap),
        _ => Err(CapError::UnknownCap(name.to_string())),
    }
}

/// The lowercase `cap_*` name of a capability.
pub fn cap_to_name(cap: Cap) -> String {
    format!("cap_{cap:?}").to_lowercase()
}

/// Highest capability the running kernel knows.
pub fn cap_max() -> Cap {
    supported()
        .iter()
        .last()
        .expect("kernel supports at least one capability")
}

/// Every capability supported by the running kernel.
pub fn supported() -> CapSet {
    let mut set = CapSet::empty();
    for cap in Cap::iter() {
        if cap.is_supported() {
            set.add(cap);
        }
    }
    set
}

//! Event collection behind a trait, so the aggregator and the report stay
//! portable while the kprobe backend remains Linux-only plumbing.

use std::collections::BTreeMap;
use std::path::Path;

use aya::maps::HashMap as BpfHashMap;
use aya::programs::KProbe;
use aya::util::kernel_symbols;
use aya::Ebpf;
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::Sample;

/// Default install location of the pre-built BPF object; overridable with
/// `CAPABLE_BPF_OBJECT`.
pub const DEFAULT_BPF_OBJECT: &str = "/usr/lib/capable/capable.bpf.o";

/// Kernel function the probe hooks: the entry point of the LSM capability
/// check.
const PROBE_TARGET: &str = "cap_capable";

/// Probe program name inside the object.
const PROBE_PROGRAM: &str = "bpf_cap_capable";

/// Call sites whose presence in the sampled stack marks a speculative,
/// non-mandatory capability check. Their addresses feed the kernel-side
/// blacklist map so those samples keep presence but an empty mask.
const BLACKLIST_SYMBOLS: &[&str] = &[
    "cap_bprm_creds_from_file",
    "generic_permission",
    "capable_wrt_inode_uidgid",
];

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("cannot load BPF object {path}: {detail}")]
    Load { path: String, detail: String },

    #[error("cannot attach probe to {PROBE_TARGET}: {0}")]
    Attach(String),

    #[error("BPF program {0} is missing from the object")]
    MissingProgram(&'static str),

    #[error("BPF map {0} is missing from the object")]
    MissingMap(&'static str),

    #[error("cannot read BPF map {map}: {detail}")]
    MapRead { map: &'static str, detail: String },
}

/// A source of per-pid capability aggregates. The kprobe collector is the
/// production implementation; tests feed the consumers canned samples.
pub trait CapabilityEvents {
    /// Drain the current aggregation state. Entries are consistent per key;
    /// there is no cross-key snapshot, which is fine for an advisory report.
    fn snapshot(&mut self) -> Result<Vec<Sample>, CollectorError>;
}

/// The in-kernel collector: a kprobe on the capability-check entry point
/// feeding per-pid hash maps.
pub struct KprobeCollector {
    bpf: Ebpf,
}

impl KprobeCollector {
    /// Load the object, fill the blacklist map and attach the probe.
    pub fn attach(object: &Path) -> Result<Self, CollectorError> {
        let mut bpf = Ebpf::load_file(object).map_err(|e| CollectorError::Load {
            path: object.display().to_string(),
            detail: e.to_string(),
        })?;

        fill_blacklist(&mut bpf);

        let program: &mut KProbe = bpf
            .program_mut(PROBE_PROGRAM)
            .ok_or(CollectorError::MissingProgram(PROBE_PROGRAM))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| CollectorError::Attach(e.to_string()))?;
        program
            .load()
            .map_err(|e| CollectorError::Attach(e.to_string()))?;
        program
            .attach(PROBE_TARGET, 0)
            .map_err(|e| CollectorError::Attach(e.to_string()))?;

        debug!(object = %object.display(), "probe attached");
        Ok(KprobeCollector { bpf })
    }
}

/// Resolve the blacklist symbols against the running kernel and store their
/// addresses at small integer keys. A missing symbol is only a warning: the
/// probe still works, with more false positives.
fn fill_blacklist(bpf: &mut Ebpf) {
    let symbols: BTreeMap<u64, String> = match kernel_symbols() {
        Ok(map) => map,
        Err(e) => {
            warn!(error = %e, "cannot read kernel symbols; blacklist disabled");
            return;
        }
    };

    let Some(map) = bpf.map_mut("kallsyms_map") else {
        warn!("object has no kallsyms_map; blacklist disabled");
        return;
    };
    let mut blacklist: BpfHashMap<_, u32, u64> = match BpfHashMap::try_from(map) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "kallsyms_map has an unexpected shape");
            return;
        }
    };

    let mut index = 0u32;
    for &wanted in BLACKLIST_SYMBOLS {
        match symbols.iter().find(|(_, name)| name.as_str() == wanted) {
            Some((addr, _)) => {
                if let Err(e) = blacklist.insert(index, *addr, 0) {
                    warn!(symbol = wanted, error = %e, "cannot insert blacklist entry");
                } else {
                    index += 1;
                }
            }
            None => debug!(symbol = wanted, "not present in this kernel"),
        }
    }
}

impl CapabilityEvents for KprobeCollector {
    fn snapshot(&mut self) -> Result<Vec<Sample>, CollectorError> {
        let caps: BTreeMap<u32, u64> = read_map(&self.bpf, "capabilities_map")?;
        let ppids: BTreeMap<u32, u32> = read_map(&self.bpf, "ppid_map")?;
        let uid_gids: BTreeMap<u32, u64> = read_map(&self.bpf, "uid_gid_map")?;
        let namespaces: BTreeMap<u32, u64> = read_map(&self.bpf, "pnsid_nsid_map")?;

        let mut samples = Vec::with_capacity(caps.len());
        for (&pid, &mask) in &caps {
            let uid_gid = uid_gids.get(&pid).copied().unwrap_or(0);
            let pnsid_nsid = namespaces.get(&pid).copied().unwrap_or(0);
            samples.push(Sample {
                pid,
                ppid: ppids.get(&pid).copied().unwrap_or(0),
                uid: uid_gid as u32,
                gid: (uid_gid >> 32) as u32,
                ns: pnsid_nsid as u32,
                parent_ns: (pnsid_nsid >> 32) as u32,
                mask,
            });
        }
        samples.sort_by_key(|s| s.pid);
        Ok(samples)
    }
}

fn read_map<V: aya::Pod>(bpf: &Ebpf, name: &'static str) -> Result<BTreeMap<u32, V>, CollectorError> {
    let map = bpf.map(name).ok_or(CollectorError::MissingMap(name))?;
    let map: BpfHashMap<_, u32, V> =
        BpfHashMap::try_from(map).map_err(|e| CollectorError::MapRead {
            map: name,
            detail: e.to_string(),
        })?;

    let mut out = BTreeMap::new();
    for entry in map.iter() {
        let (key, value) = entry.map_err(|e| CollectorError::MapRead {
            map: name,
            detail: e.to_string(),
        })?;
        out.insert(key, value);
    }
    Ok(out)
}

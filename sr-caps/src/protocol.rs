//! Wire protocol between the launcher and the `sr_aux` helper.
//!
//! The resolved settings travel over an inherited pipe as a single
//! length-prefixed JSON frame, so the helper never trusts its argv or its
//! environment for anything security-relevant.

use std::io::{self, Read, Write};

use capctl::caps::CapSet;
use serde::{Deserialize, Serialize};

use crate::caps::{cap_from_name, cap_to_name};

/// Upper bound on a frame; a resolved settings block is a few KB at most.
const MAX_FRAME: usize = 64 * 1024;

/// Everything the helper needs to finish the launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySpec {
    /// Capability names for the Inheritable set.
    pub inheritable: Vec<String>,
    /// Capability names to raise in the Ambient set; subset of inheritable.
    pub ambient: Vec<String>,
    /// Bounding mask; `None` leaves the bounding set untouched (full).
    pub bounding: Option<Vec<String>>,
    pub no_root: bool,
    /// Filtered environment, already containing the secure `PATH`.
    pub env: Vec<(String, String)>,
    /// Role name, for the synthesized `PS1` prompt.
    pub role: String,
    /// Command argv with an absolute `argv[0]`; empty means an interactive
    /// shell.
    pub command: Vec<String>,
}

/// Render a capability set as sorted lowercase names for the wire.
pub fn caps_to_names(set: CapSet) -> Vec<String> {
    let mut names: Vec<String> = set.iter().map(cap_to_name).collect();
    names.sort();
    names
}

/// Parse wire names back into a set. Unknown names are a hard protocol
/// error; the policy layer already validated them.
pub fn names_to_caps(names: &[String]) -> io::Result<CapSet> {
    let mut set = CapSet::empty();
    for name in names {
        let cap = cap_from_name(name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        set.add(cap);
    }
    Ok(set)
}

/// Write a frame: 4-byte big-endian length prefix followed by JSON.
pub fn write_frame<W: Write>(writer: &mut W, spec: &ApplySpec) -> io::Result<()> {
    let payload = serde_json::to_vec(spec).map_err(io::Error::other)?;
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len)?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Read one length-prefixed frame.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<ApplySpec> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    serde_json::from_slice(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use capctl::caps::Cap;
    use pretty_assertions::assert_eq;

    fn spec() -> ApplySpec {
        ApplySpec {
            inheritable: vec!["cap_net_bind_service".into()],
            ambient: vec!["cap_net_bind_service".into()],
            bounding: Some(vec!["cap_net_bind_service".into()]),
            no_root: true,
            env: vec![("PATH".into(), "/usr/bin".into())],
            role: "web".into(),
            command: vec!["/usr/sbin/nginx".into(), "-c".into(), "/etc/nginx.conf".into()],
        }
    }

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &spec()).unwrap();
        let decoded = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, spec());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME as u32 + 1).to_be_bytes());
        assert!(read_frame(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn cap_names_round_trip() {
        let mut set = CapSet::empty();
        set.add(Cap::NET_RAW);
        set.add(Cap::CHOWN);
        let names = caps_to_names(set);
        assert_eq!(names, vec!["cap_chown", "cap_net_raw"]);
        assert_eq!(names_to_caps(&names).unwrap(), set);
    }

    #[test]
    fn zero_caps_is_representable() {
        let names = caps_to_names(CapSet::empty());
        assert!(names.is_empty());
        assert_eq!(names_to_caps(&names).unwrap(), CapSet::empty());
    }
}

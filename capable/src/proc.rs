//! Pid decoding via procfs.

use std::path::PathBuf;

/// Best-effort name for a pid: the first word of `/proc/<pid>/cmdline`,
/// falling back to the `exe` link, then to a placeholder for processes that
/// exited before the drain.
pub fn process_name(pid: u32) -> String {
    if let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) {
        if let Some(first) = cmdline.split(|&b| b == 0).next() {
            if !first.is_empty() {
                return String::from_utf8_lossy(first).into_owned();
            }
        }
    }
    std::fs::read_link(format!("/proc/{pid}/exe"))
        .unwrap_or_else(|_| PathBuf::from("<exited>"))
        .display()
        .to_string()
}

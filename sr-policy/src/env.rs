//! Environment filtering for the child process.
//!
//! The child never inherits the invoker's environment wholesale: variables
//! survive only through the keep-list (by name) or the check-list (by name
//! and a value-safety predicate), and `PATH` is unconditionally replaced by
//! the policy's secure value.

const PATH_MAX: usize = 4096;

/// Match an environment variable name against a policy entry. Entries are
/// exact names, except a trailing `*` makes the entry a prefix match
/// (`LC_*`).
fn name_matches(name: &str, entry: &str) -> bool {
    match entry.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => name == entry,
    }
}

fn in_list(name: &str, list: &[String]) -> bool {
    list.iter().any(|entry| name_matches(name, entry))
}

/// Safety predicate for checked variables.
///
/// `TZ` gets the tzcode-specific treatment; everything else passes when the
/// value cannot smuggle a path (`/`) or a format expansion (`%`).
pub fn value_is_safe(name: &str, value: &str) -> bool {
    if name == "TZ" {
        return tz_is_safe(value);
    }
    !value.contains(['/', '%'])
}

/// tzcode treats a value starting with `:` as a file reference and a leading
/// `/` as an absolute path; both, and `..` traversal, are rejected.
fn tz_is_safe(value: &str) -> bool {
    let value = value.strip_prefix(':').unwrap_or(value);

    if value.starts_with('/') {
        return false;
    }
    if value.len() >= PATH_MAX {
        return false;
    }

    let mut last = '/';
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() || !c.is_ascii_graphic() {
            return false;
        }
        if last == '/' && c == '.' {
            if let Some('.') = chars.peek() {
                chars.next();
                match chars.peek() {
                    Some('/') | None => return false,
                    _ => {}
                }
                last = '.';
                continue;
            }
        }
        last = c;
    }
    true
}

/// Produce the child environment from the invoker's, in stable input order.
///
/// A name in both lists behaves as keep: the keep-list is consulted first
/// and short-circuits the value check. `PATH` is replaced in place when
/// present, appended otherwise.
pub fn filter_env(
    invoker_env: &[(String, String)],
    keep: &[String],
    check: &[String],
    secure_path: &str,
) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(invoker_env.len() + 1);
    let mut saw_path = false;

    for (name, value) in invoker_env {
        if name == "PATH" {
            out.push(("PATH".to_string(), secure_path.to_string()));
            saw_path = true;
        } else if in_list(name, keep) {
            out.push((name.clone(), value.clone()));
        } else if in_list(name, check) && value_is_safe(name, value) {
            out.push((name.clone(), value.clone()));
        }
    }

    if !saw_path {
        out.push(("PATH".to_string(), secure_path.to_string()));
    }
    out
}

//! Command canonicalisation and pattern matching.
//!
//! An invocation is reduced to a canonical form — absolute executable path
//! plus the argv tail, joined with single spaces — and compared against the
//! patterns of a task. Each successful comparison is tagged with a
//! [`PatternClass`]; lower classes are more specific and win during
//! matching.

use std::path::{Path, PathBuf};

use crate::error::CommandError;

/// Characters whose presence makes a pattern string a regex rather than a
/// literal.
const REGEX_METACHARS: &[char] = &[
    '.', '^', '+', '*', '?', '(', ')', '[', ']', '{', '}', '|', '\\',
];

/// Glob metacharacters on the path side of a pattern.
const GLOB_METACHARS: &[char] = &['*', '?', '['];

pub fn may_be_regex(s: &str) -> bool {
    s.contains(REGEX_METACHARS)
}

/// Canonical form of an invocation: absolute resolved path + verbatim argv
/// tail. The argv elements are never re-split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub path: PathBuf,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Resolve `argv[0]` to an absolute executable and keep the remaining
    /// arguments verbatim.
    ///
    /// An `argv[0]` containing a `/` is resolved relative to the filesystem
    /// and must be executable; anything else is looked up on `$PATH` with an
    /// `X_OK` check, the way a shell would.
    pub fn from_argv(argv: &[String]) -> Result<CommandLine, CommandError> {
        let program = argv.first().ok_or(CommandError::Empty)?;

        let path = if program.contains('/') {
            let path = std::fs::canonicalize(program)
                .map_err(|e| CommandError::NotFound(program.clone(), e.to_string()))?;
            if !is_executable(&path) {
                return Err(CommandError::NotExecutable(path));
            }
            path
        } else {
            which::which(program)
                .map_err(|e| CommandError::NotFound(program.clone(), e.to_string()))?
        };

        Ok(CommandLine {
            path,
            args: argv[1..].to_vec(),
        })
    }

    /// The space-joined canonical string, with `argv[0]` replaced by the
    /// absolute path.
    pub fn joined(&self) -> String {
        if self.args.is_empty() {
            self.path.display().to_string()
        } else {
            format!("{} {}", self.path.display(), self.args.join(" "))
        }
    }

    fn joined_args(&self) -> String {
        self.args.join(" ")
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Specificity classes, most specific first. The discriminants are the
/// command-score component of the matcher's ranking tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum PatternClass {
    /// `/bin/ls -al` — literal path, literal args.
    PathArgStrict = 0,
    /// `/bin/ls` — literal path, matches only a zero-argument call.
    PathStrict = 1,
    /// `/bin/ls -*(a|l)` — literal path, regex args.
    PathStrictArgWildcard = 2,
    /// `/bin/l* -l` — glob path, literal args.
    PathWildcardArgStrict = 3,
    /// `/bin/l*` — glob path, no args permitted.
    PathWildcard = 4,
    /// `/bin/l* -(l|a)*` — glob path, regex args.
    PathArgWildcard = 5,
    /// `* -a` — any path, literal args.
    PathFullWildcardArgStrict = 6,
    /// `* -(a|l)` — any path, regex args.
    PathFullWildcardArgWildcard = 7,
    /// `*` — any path, no args permitted.
    PathFullWildcard = 8,
    /// `**` — any command with any arguments.
    PathArgFullWildcard = 9,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathPart {
    Literal(String),
    Glob(String),
    /// `*` — any single absolute path.
    Any,
    /// `**` — any command, any arguments.
    AnyCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArgsPart {
    Absent,
    Literal(String),
    /// Anchored on both ends before compilation.
    Regex(String),
}

/// A parsed command pattern from the policy document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPattern {
    raw: String,
    path: PathPart,
    args: ArgsPart,
}

impl CommandPattern {
    /// Parse a pattern string. The first unescaped space separates the path
    /// part from the args part; escaped spaces (`\ `) belong to the path.
    pub fn parse(raw: &str) -> Result<CommandPattern, CommandError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CommandError::EmptyPattern);
        }
        if raw == "**" {
            return Ok(CommandPattern {
                raw: raw.to_string(),
                path: PathPart::AnyCommand,
                args: ArgsPart::Absent,
            });
        }

        let (path_str, args_str) = split_pattern(raw);

        if !path_str.starts_with('/') && path_str != "*" {
            return Err(CommandError::RelativePattern(raw.to_string()));
        }

        let path = if path_str == "*" {
            PathPart::Any
        } else if path_str.contains(GLOB_METACHARS) {
            glob::Pattern::new(&path_str)
                .map_err(|e| CommandError::BadGlob(path_str.clone(), e.to_string()))?;
            PathPart::Glob(path_str)
        } else {
            PathPart::Literal(path_str)
        };

        let args = match args_str {
            None => ArgsPart::Absent,
            // A bare `*` on the args side means "any arguments", which as a
            // regex is `.*`.
            Some(s) if s == "*" => ArgsPart::Regex(".*".to_string()),
            Some(s) if may_be_regex(&s) => {
                regex::Regex::new(&format!("^{s}$"))
                    .map_err(|e| CommandError::BadRegex(s.clone(), e.to_string()))?;
                ArgsPart::Regex(s)
            }
            Some(s) => ArgsPart::Literal(s),
        };

        Ok(CommandPattern {
            raw: raw.to_string(),
            path,
            args,
        })
    }

    /// The pattern exactly as written in the document.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a canonical command line, returning the specificity class on
    /// success.
    pub fn matches(&self, cmd: &CommandLine) -> Option<PatternClass> {
        if let PathPart::AnyCommand = self.path {
            return Some(PatternClass::PathArgFullWildcard);
        }

        let path_str = cmd.path.display().to_string();
        match &self.path {
            PathPart::Literal(p) if *p != path_str => return None,
            PathPart::Glob(p) => {
                // Pattern validity was checked at parse time.
                let pat = glob::Pattern::new(p).ok()?;
                if !pat.matches(&path_str) {
                    return None;
                }
            }
            _ => {}
        }

        let args_ok = match &self.args {
            ArgsPart::Absent => cmd.args.is_empty(),
            ArgsPart::Literal(a) => cmd.joined_args() == *a,
            ArgsPart::Regex(r) => args_regex_match(r, cmd),
        };
        if !args_ok {
            return None;
        }

        Some(match (&self.path, &self.args) {
            (PathPart::Literal(_), ArgsPart::Literal(_)) => PatternClass::PathArgStrict,
            (PathPart::Literal(_), ArgsPart::Absent) => PatternClass::PathStrict,
            (PathPart::Literal(_), ArgsPart::Regex(_)) => PatternClass::PathStrictArgWildcard,
            (PathPart::Glob(_), ArgsPart::Literal(_)) => PatternClass::PathWildcardArgStrict,
            (PathPart::Glob(_), ArgsPart::Absent) => PatternClass::PathWildcard,
            (PathPart::Glob(_), ArgsPart::Regex(_)) => PatternClass::PathArgWildcard,
            (PathPart::Any, ArgsPart::Literal(_)) => PatternClass::PathFullWildcardArgStrict,
            (PathPart::Any, ArgsPart::Regex(_)) => PatternClass::PathFullWildcardArgWildcard,
            (PathPart::Any, ArgsPart::Absent) => PatternClass::PathFullWildcard,
            (PathPart::AnyCommand, _) => unreachable!("handled above"),
        })
    }
}

fn args_regex_match(pattern: &str, cmd: &CommandLine) -> bool {
    match regex::Regex::new(&format!("^{pattern}$")) {
        Ok(re) => re.is_match(&cmd.joined_args()),
        Err(_) => false,
    }
}

/// Split a pattern at the first unescaped space. `\ ` sequences in the path
/// part are unescaped into plain spaces.
fn split_pattern(raw: &str) -> (String, Option<String>) {
    let mut path = String::with_capacity(raw.len());
    let mut chars = raw.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some((_, next)) = chars.next() {
                    if next == ' ' {
                        path.push(' ');
                    } else {
                        path.push('\\');
                        path.push(next);
                    }
                }
            }
            ' ' | '\t' => {
                let rest = raw[i..].trim_start();
                let args = (!rest.is_empty()).then(|| rest.to_string());
                return (path, args);
            }
            _ => path.push(c),
        }
    }
    (path, None)
}

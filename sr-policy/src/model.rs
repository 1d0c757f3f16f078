//! Owned in-memory policy tree.
//!
//! The document is parsed once per invocation and never mutated afterwards.
//! Roles, tasks and actors live in flat vectors addressed by integer ids;
//! the matcher returns ids and the launcher resolves them once.

use capctl::caps::CapSet;

use crate::command::CommandPattern;

/// Index of a role in [`Policy::roles`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoleId(pub usize);

/// Index of a task within its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub role: RoleId,
    pub task: usize,
}

/// Someone authorised to assume a role: a user name, or a conjunction of
/// group names (every listed group must be held by the invoker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    User(String),
    /// Comma-separated in the document; all names must match.
    GroupList(Vec<String>),
}

/// The capability grant of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapGrant {
    /// No capabilities at all. Still a valid task.
    Empty,
    /// A specific set of named capabilities.
    Set(CapSet),
    /// Every capability the running kernel supports.
    All,
}

impl CapGrant {
    /// Resolve to a concrete set over the kernel's supported capabilities.
    pub fn to_set(&self) -> CapSet {
        match self {
            CapGrant::Empty => CapSet::empty(),
            CapGrant::Set(set) => *set,
            CapGrant::All => crate::matcher::kernel_caps(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CapGrant::Empty)
    }
}

/// Target user of a task, as written in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetUser {
    Name(String),
    Id(u32),
}

impl TargetUser {
    /// Whether this target designates root without a user-database lookup.
    pub fn is_root(&self) -> bool {
        match self {
            TargetUser::Name(name) => name == "root",
            TargetUser::Id(id) => *id == 0,
        }
    }
}

/// An `allow-root` / `allow-bounding` style option with its `enforce` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Toggle {
    pub value: bool,
    pub enforce: bool,
}

/// Option overrides, present at document root, role and task scope.
/// `None` fields inherit from the outer scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionBlock {
    pub path: Option<String>,
    pub env_keep: Option<Vec<String>>,
    pub env_check: Option<Vec<String>>,
    pub allow_root: Option<Toggle>,
    pub allow_bounding: Option<Toggle>,
}

/// A task: command patterns plus the privileges granted for them.
#[derive(Debug, Clone)]
pub struct Task {
    pub commands: Vec<CommandPattern>,
    pub caps: CapGrant,
    pub setuser: Option<TargetUser>,
    /// First entry is the primary group, the rest supplementary.
    pub setgroups: Vec<String>,
    pub options: OptionBlock,
    /// Set when the document names a capability the kernel does not know.
    /// The task stays in the tree for diagnostics but never matches.
    pub unmatchable: Option<String>,
}

impl Task {
    pub fn setuid_root(&self) -> bool {
        self.setuser.as_ref().is_some_and(TargetUser::is_root)
    }

    pub fn setgid_root(&self) -> bool {
        self.setgroups.first().is_some_and(|g| g == "root" || g == "0")
    }
}

#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub actors: Vec<Actor>,
    pub tasks: Vec<Task>,
    pub options: OptionBlock,
}

/// The whole configuration document.
#[derive(Debug, Clone)]
pub struct Policy {
    pub roles: Vec<Role>,
    /// Document-root option block.
    pub options: OptionBlock,
}

impl Policy {
    pub fn role(&self, id: RoleId) -> &Role {
        &self.roles[id.0]
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.roles[id.role.0].tasks[id.task]
    }

    pub fn role_by_name(&self, name: &str) -> Option<RoleId> {
        self.roles.iter().position(|r| r.name == name).map(RoleId)
    }
}

/// Built-in defaults applied when no scope specifies an option.
pub mod defaults {
    pub const ENV_KEEP: &[&str] = &[
        "HOME",
        "USER",
        "LOGNAME",
        "COLORS",
        "DISPLAY",
        "HOSTNAME",
        "KRB5CCNAME",
        "LS_COLORS",
        "PS1",
        "PS2",
        "XAUTHORITY",
        "XAUTHORIZATION",
        "XDG_CURRENT_DESKTOP",
    ];

    pub const ENV_CHECK: &[&str] = &[
        "COLORTERM",
        "LANG",
        "LANGUAGE",
        "LC_*",
        "LINGUAS",
        "TERM",
        "TZ",
    ];

    pub const PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/snap/bin";

    /// Running as root is refused unless the policy opts out.
    pub const NO_ROOT: bool = true;

    /// The bounding set is restricted to the task's capabilities unless the
    /// policy opts out.
    pub const BOUNDING: bool = true;
}

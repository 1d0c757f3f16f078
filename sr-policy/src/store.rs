//! On-disk policy document.
//!
//! The document is read in a single open-read-close, checked for sane
//! ownership and mode, deserialized into a serde mirror of the XML grammar,
//! then built into the owned [`Policy`] tree. Rendering goes the other way
//! and round-trips structurally.

use std::path::Path;
use std::str::FromStr;

use capctl::caps::{Cap, CapSet};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::CommandPattern;
use crate::error::PolicyError;
use crate::model::{
    Actor, CapGrant, OptionBlock, Policy, Role, Task, TargetUser, Toggle,
};

/// Widest mode the policy file may carry.
const MAX_MODE: u32 = 0o644;

// ---------------------------------------------------------------------------
// Serde mirror of the document grammar
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "rootasrole")]
struct DocXml {
    #[serde(rename = "@version", default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<OptionsXml>,
    #[serde(rename = "role", default)]
    roles: Vec<RoleXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RoleXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "user", default)]
    users: Vec<UserXml>,
    #[serde(rename = "group", default)]
    groups: Vec<GroupXml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<OptionsXml>,
    #[serde(rename = "task", default)]
    tasks: Vec<TaskXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserXml {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupXml {
    /// Comma-separated conjunction of group names.
    #[serde(rename = "@names")]
    names: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskXml {
    #[serde(rename = "@setuser", default, skip_serializing_if = "Option::is_none")]
    setuser: Option<String>,
    #[serde(rename = "@setgroups", default, skip_serializing_if = "Option::is_none")]
    setgroups: Option<String>,
    #[serde(rename = "command", default)]
    commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capabilities: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<OptionsXml>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct OptionsXml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(rename = "env-keep", default, skip_serializing_if = "Option::is_none")]
    env_keep: Option<String>,
    #[serde(rename = "env-check", default, skip_serializing_if = "Option::is_none")]
    env_check: Option<String>,
    #[serde(rename = "allow-root", default, skip_serializing_if = "Option::is_none")]
    allow_root: Option<ToggleXml>,
    #[serde(
        rename = "allow-bounding",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    allow_bounding: Option<ToggleXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ToggleXml {
    #[serde(rename = "@enforce", default)]
    enforce: Option<bool>,
    #[serde(rename = "$text")]
    value: bool,
}

// ---------------------------------------------------------------------------
// Load / render
// ---------------------------------------------------------------------------

/// Load, verify and build the policy from `path`.
pub fn load(path: &Path) -> Result<Policy, PolicyError> {
    if !path.exists() {
        return Err(PolicyError::Missing(path.to_path_buf()));
    }
    check_permissions(path)?;

    let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    parse(&text, path)
}

/// Parse a document from text. Separated from [`load`] so tests and editors
/// can work on in-memory documents.
pub fn parse(text: &str, path: &Path) -> Result<Policy, PolicyError> {
    let doc: DocXml = quick_xml::de::from_str(text).map_err(|e| PolicyError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    build(doc, path)
}

/// Render a policy back to the document grammar.
pub fn render(policy: &Policy) -> String {
    let doc = unbuild(policy);
    // The mirror structs only hold strings and bools; serialization cannot
    // fail on them.
    quick_xml::se::to_string(&doc).expect("policy serialization")
}

fn check_permissions(path: &Path) -> Result<(), PolicyError> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).map_err(|source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mode = meta.mode() & 0o777;
    if meta.uid() != 0 || mode & !MAX_MODE != 0 {
        return Err(PolicyError::Permissions {
            path: path.to_path_buf(),
            uid: meta.uid(),
            mode,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// XML → model
// ---------------------------------------------------------------------------

fn build(doc: DocXml, path: &Path) -> Result<Policy, PolicyError> {
    let mut roles = Vec::with_capacity(doc.roles.len());
    for role_xml in doc.roles {
        if role_xml.name.is_empty() {
            return Err(validation(path, "role", "role name must not be empty"));
        }
        if roles.iter().any(|r: &Role| r.name == role_xml.name) {
            return Err(validation(
                path,
                &format!("role \"{}\"", role_xml.name),
                "duplicate role name",
            ));
        }

        let mut actors = Vec::new();
        for user in role_xml.users {
            actors.push(Actor::User(user.name));
        }
        for group in role_xml.groups {
            let names = split_list(&group.names);
            if names.is_empty() {
                return Err(validation(
                    path,
                    &format!("role \"{}\" group", role_xml.name),
                    "empty group list",
                ));
            }
            actors.push(Actor::GroupList(names));
        }

        let mut tasks = Vec::with_capacity(role_xml.tasks.len());
        for (idx, task_xml) in role_xml.tasks.into_iter().enumerate() {
            tasks.push(build_task(task_xml, &role_xml.name, idx, path)?);
        }

        roles.push(Role {
            name: role_xml.name,
            actors,
            tasks,
            options: build_options(role_xml.options),
        });
    }

    Ok(Policy {
        roles,
        options: build_options(doc.options),
    })
}

fn build_task(
    task_xml: TaskXml,
    role_name: &str,
    index: usize,
    path: &Path,
) -> Result<Task, PolicyError> {
    let element = format!("role \"{role_name}\" task {index}");
    if task_xml.commands.is_empty() {
        return Err(validation(path, &element, "task has no command pattern"));
    }

    let mut commands = Vec::with_capacity(task_xml.commands.len());
    for raw in &task_xml.commands {
        let pattern = CommandPattern::parse(raw)
            .map_err(|e| validation(path, &element, &e.to_string()))?;
        commands.push(pattern);
    }

    let (caps, unmatchable) = parse_caps(task_xml.capabilities.as_deref(), &element);

    let setuser = task_xml.setuser.map(|s| match s.parse::<u32>() {
        Ok(id) => TargetUser::Id(id),
        Err(_) => TargetUser::Name(s),
    });

    let setgroups = task_xml
        .setgroups
        .map(|s| split_list(&s))
        .unwrap_or_default();

    Ok(Task {
        commands,
        caps,
        setuser,
        setgroups,
        options: build_options(task_xml.options),
        unmatchable,
    })
}

/// Parse the `<capabilities>` text. An unknown name does not fail the load:
/// the task is kept but marked unmatchable, per the policy invariants.
fn parse_caps(text: Option<&str>, element: &str) -> (CapGrant, Option<String>) {
    let text = match text {
        None => return (CapGrant::Empty, None),
        Some(t) => t.trim(),
    };
    if text.is_empty() {
        return (CapGrant::Empty, None);
    }
    if text.eq_ignore_ascii_case("all") {
        return (CapGrant::All, None);
    }

    let mut set = CapSet::empty();
    for name in split_list(text) {
        match parse_cap_name(&name) {
            Some(cap) if cap.is_supported() => set.add(cap),
            _ => {
                warn!(element, capability = name.as_str(), "unknown capability; task will never match");
                return (CapGrant::Empty, Some(name));
            }
        }
    }
    (CapGrant::Set(set), None)
}

/// Accepts `cap_net_raw`, `CAP_NET_RAW` or `net_raw`.
pub fn parse_cap_name(name: &str) -> Option<Cap> {
    let normalized = name.trim().to_lowercase();
    let with_prefix = if normalized.starts_with("cap_") {
        normalized
    } else {
        format!("cap_{normalized}")
    };
    Cap::from_str(&with_prefix).ok()
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_options(options: Option<OptionsXml>) -> OptionBlock {
    let Some(options) = options else {
        return OptionBlock::default();
    };
    OptionBlock {
        path: options.path,
        env_keep: options.env_keep.map(|s| split_list(&s)),
        env_check: options.env_check.map(|s| split_list(&s)),
        allow_root: options.allow_root.map(toggle),
        allow_bounding: options.allow_bounding.map(toggle),
    }
}

fn toggle(t: ToggleXml) -> Toggle {
    Toggle {
        value: t.value,
        enforce: t.enforce.unwrap_or(false),
    }
}

// ---------------------------------------------------------------------------
// Model → XML
// ---------------------------------------------------------------------------

fn unbuild(policy: &Policy) -> DocXml {
    DocXml {
        version: None,
        options: unbuild_options(&policy.options),
        roles: policy
            .roles
            .iter()
            .map(|role| RoleXml {
                name: role.name.clone(),
                users: role
                    .actors
                    .iter()
                    .filter_map(|a| match a {
                        Actor::User(name) => Some(UserXml { name: name.clone() }),
                        _ => None,
                    })
                    .collect(),
                groups: role
                    .actors
                    .iter()
                    .filter_map(|a| match a {
                        Actor::GroupList(names) => Some(GroupXml {
                            names: names.join(","),
                        }),
                        _ => None,
                    })
                    .collect(),
                options: unbuild_options(&role.options),
                tasks: role.tasks.iter().map(unbuild_task).collect(),
            })
            .collect(),
    }
}

fn unbuild_task(task: &Task) -> TaskXml {
    TaskXml {
        setuser: task.setuser.as_ref().map(|u| match u {
            TargetUser::Name(name) => name.clone(),
            TargetUser::Id(id) => id.to_string(),
        }),
        setgroups: (!task.setgroups.is_empty()).then(|| task.setgroups.join(",")),
        commands: task.commands.iter().map(|c| c.as_str().to_string()).collect(),
        capabilities: match &task.caps {
            CapGrant::Empty => None,
            CapGrant::All => Some("all".to_string()),
            CapGrant::Set(set) => Some(
                set.iter()
                    .map(|cap| format!("cap_{cap:?}").to_lowercase())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        },
        options: unbuild_options(&task.options),
    }
}

fn unbuild_options(options: &OptionBlock) -> Option<OptionsXml> {
    if *options == OptionBlock::default() {
        return None;
    }
    Some(OptionsXml {
        path: options.path.clone(),
        env_keep: options.env_keep.as_ref().map(|l| l.join(",")),
        env_check: options.env_check.as_ref().map(|l| l.join(",")),
        allow_root: options.allow_root.map(untoggle),
        allow_bounding: options.allow_bounding.map(untoggle),
    })
}

fn untoggle(t: Toggle) -> ToggleXml {
    ToggleXml {
        enforce: Some(t.enforce),
        value: t.value,
    }
}

fn validation(path: &Path, element: &str, detail: &str) -> PolicyError {
    PolicyError::Validation {
        path: path.to_path_buf(),
        element: element.to_string(),
        detail: detail.to_string(),
    }
}

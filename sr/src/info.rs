//! The `-i` listing: which roles and commands the invoker may use.

use sr_policy::matcher::actor_matches;
use sr_policy::model::{CapGrant, Policy, Role};

use crate::identity::Invoker;

const ELEMENT: &str = "├─ ";
const END: &str = "└─ ";
const SPACE: &str = "   ";

/// Print the rights of the invoker, restricted to one role when requested.
/// Returns false when the requested role exists but is not available to the
/// invoker, or no role is.
pub fn print_rights(policy: &Policy, invoker: &Invoker, role_filter: Option<&str>) -> bool {
    let mut printed = false;
    for role in &policy.roles {
        if let Some(wanted) = role_filter {
            if role.name != wanted {
                continue;
            }
        }
        if !actor_matches(role, &invoker.name, &invoker.groups, invoker.uid) {
            continue;
        }
        print_role(role);
        printed = true;
    }
    if !printed {
        println!("Permission denied");
    }
    printed
}

fn print_role(role: &Role) {
    println!("Role \"{}\"", role.name);
    let last_task = role.tasks.len().saturating_sub(1);
    for (idx, task) in role.tasks.iter().enumerate() {
        let branch = if idx == last_task { END } else { ELEMENT };
        match &task.caps {
            CapGrant::Empty => println!("{branch}Commands without capabilities:"),
            CapGrant::All => println!("{branch}Commands with all capabilities:"),
            CapGrant::Set(set) => {
                let names: Vec<String> = set
                    .iter()
                    .map(|cap| format!("cap_{cap:?}").to_lowercase())
                    .collect();
                println!("{branch}Commands with capabilities {}:", names.join(","));
            }
        }
        let prefix = if idx == last_task { SPACE } else { "│  " };
        let last_cmd = task.commands.len().saturating_sub(1);
        for (cidx, command) in task.commands.iter().enumerate() {
            let cmd_branch = if cidx == last_cmd { END } else { ELEMENT };
            println!("{prefix}{cmd_branch}{}", command.as_str());
        }
    }
}

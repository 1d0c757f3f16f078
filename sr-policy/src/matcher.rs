//! Task selection.
//!
//! Every (role, task) candidate is scored with a lexicographic tuple;
//! the smallest tuple wins. A tie between two distinct candidates is an
//! error rather than an arbitrary choice.

use capctl::caps::{Cap, CapSet};
use tracing::{debug, warn};

use crate::command::CommandLine;
use crate::error::MatchError;
use crate::model::{
    defaults, Actor, OptionBlock, Policy, Role, RoleId, Task, TaskId, TargetUser, Toggle,
};

/// Capabilities considered "administrative": a task whose grant stays inside
/// this set ranks between a no-capability task and one asking for arbitrary
/// specific capabilities.
pub fn admin_caps() -> CapSet {
    let mut set = CapSet::empty();
    for cap in [
        Cap::CHOWN,
        Cap::DAC_OVERRIDE,
        Cap::DAC_READ_SEARCH,
        Cap::FOWNER,
        Cap::KILL,
        Cap::SETGID,
        Cap::SETUID,
        Cap::SETPCAP,
        Cap::NET_ADMIN,
        Cap::SYS_CHROOT,
        Cap::SYS_PTRACE,
        Cap::SYS_ADMIN,
        Cap::SYS_BOOT,
        Cap::SYS_NICE,
        Cap::SYS_RESOURCE,
        Cap::SYS_TIME,
        Cap::MKNOD,
        Cap::AUDIT_WRITE,
        Cap::SETFCAP,
    ] {
        set.add(cap);
    }
    set
}

/// Every capability the running kernel supports.
pub fn kernel_caps() -> CapSet {
    let mut set = CapSet::empty();
    for cap in Cap::iter() {
        if cap.is_supported() {
            set.add(cap);
        }
    }
    set
}

/// An invocation to be matched against the policy.
#[derive(Debug)]
pub struct MatchRequest<'a> {
    pub invoker_uid: u32,
    pub user: &'a str,
    pub groups: &'a [String],
    /// `-r`: restrict candidates to this role.
    pub role: Option<&'a str>,
    pub command: &'a CommandLine,
}

/// Settings resolved from the winning task plus the option scopes around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub role_name: String,
    /// The Inheritable set; exactly the task's capabilities.
    pub caps: CapSet,
    pub target_user: Option<TargetUser>,
    /// First entry primary, rest supplementary.
    pub target_groups: Vec<String>,
    pub no_root: bool,
    pub bounding: bool,
    pub path: String,
    pub env_keep: Vec<String>,
    pub env_check: Vec<String>,
}

#[derive(Debug)]
pub struct MatchOutcome {
    pub role: RoleId,
    pub task: TaskId,
    pub settings: Settings,
}

/// The ranking tuple, compared lexicographically; smaller is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Score {
    actor: u32,
    command: u32,
    caps: u32,
    setuid: u32,
    group_breadth: u32,
    security: u32,
}

const NO_MATCH: u32 = u32::MAX;

/// Pick the unique minimal (role, task) for the request, or explain why not.
pub fn find_task(policy: &Policy, req: &MatchRequest<'_>) -> Result<MatchOutcome, MatchError> {
    let candidate_roles: Vec<RoleId> = match req.role {
        Some(name) => {
            let id = policy
                .role_by_name(name)
                .ok_or_else(|| MatchError::RoleUnknown(name.to_string()))?;
            vec![id]
        }
        None => (0..policy.roles.len()).map(RoleId).collect(),
    };

    let mut best: Option<(Score, TaskId)> = None;
    let mut tied: Vec<TaskId> = Vec::new();

    for role_id in candidate_roles {
        let role = policy.role(role_id);
        let actor = actor_score(role, req);
        if actor == NO_MATCH {
            continue;
        }

        for (task_idx, task) in role.tasks.iter().enumerate() {
            if let Some(cap_name) = &task.unmatchable {
                warn!(
                    role = role.name.as_str(),
                    task = task_idx,
                    capability = cap_name.as_str(),
                    "task names a capability unknown to this kernel; skipping"
                );
                continue;
            }
            let command = command_score(task, req.command);
            if command == NO_MATCH {
                continue;
            }

            let id = TaskId {
                role: role_id,
                task: task_idx,
            };
            let resolved = resolve_options(policy, role, task);
            let score = Score {
                actor,
                command,
                caps: caps_score(task),
                setuid: setuid_score(task),
                group_breadth: task.setgroups.len() as u32,
                security: security_score(&resolved),
            };
            debug!(role = role.name.as_str(), task = task_idx, ?score, "candidate");

            match &best {
                None => best = Some((score, id)),
                Some((best_score, best_id)) => {
                    if score < *best_score {
                        best = Some((score, id));
                        tied.clear();
                    } else if score == *best_score {
                        if tied.is_empty() {
                            tied.push(*best_id);
                        }
                        tied.push(id);
                    }
                }
            }
        }
    }

    let (_, winner) = best.ok_or(MatchError::PermissionDenied)?;

    if !tied.is_empty() {
        let names = tied
            .iter()
            .map(|id| format!("{}[task {}]", policy.role(id.role).name, id.task))
            .collect();
        return Err(MatchError::Ambiguous(names));
    }

    let role = policy.role(winner.role);
    let task = policy.task(winner);
    Ok(MatchOutcome {
        role: winner.role,
        task: winner,
        settings: build_settings(policy, role, task),
    })
}

/// Whether the invoker may assume the role at all. Used by the `-i` info
/// listing, which has no command to score.
pub fn actor_matches(role: &Role, user: &str, groups: &[String], invoker_uid: u32) -> bool {
    if invoker_uid == 0 {
        return true;
    }
    role.actors.iter().any(|actor| match actor {
        Actor::User(name) => name == user,
        Actor::GroupList(names) => {
            !names.is_empty() && names.iter().all(|n| groups.contains(n))
        }
    })
}

/// 0 exact user; 1 group entry covering all invoker groups; 2 smaller group
/// entry; `NO_MATCH` otherwise. A uid-0 invoker may assume any role, at the
/// weakest rank.
fn actor_score(role: &Role, req: &MatchRequest<'_>) -> u32 {
    let mut best = NO_MATCH;
    for actor in &role.actors {
        let score = match actor {
            Actor::User(name) if name == req.user => 0,
            Actor::User(_) => NO_MATCH,
            Actor::GroupList(names) => {
                let all_held = names.iter().all(|n| req.groups.contains(n));
                if !all_held || names.is_empty() {
                    NO_MATCH
                } else if names.len() == req.groups.len() {
                    1
                } else {
                    2
                }
            }
        };
        best = best.min(score);
    }
    if best == NO_MATCH && req.invoker_uid == 0 {
        best = 2;
    }
    best
}

/// Best (lowest) pattern class over the task's command patterns.
fn command_score(task: &Task, command: &CommandLine) -> u32 {
    task.commands
        .iter()
        .filter_map(|pattern| pattern.matches(command))
        .map(|class| class as u32)
        .min()
        .unwrap_or(NO_MATCH)
}

/// 0 no caps; 1 inside the administrative set; 2 other specific caps; 3 all.
fn caps_score(task: &Task) -> u32 {
    use crate::model::CapGrant::*;
    match &task.caps {
        Empty => 0,
        All => 3,
        Set(set) => {
            if (*set & !admin_caps()).is_empty() {
                1
            } else {
                2
            }
        }
    }
}

/// Ordered setuid/setgid states, least privileged first.
fn setuid_score(task: &Task) -> u32 {
    let setuid = task.setuser.is_some();
    let setgid = !task.setgroups.is_empty();
    let uid_root = task.setuid_root();
    let gid_root = task.setgid_root();

    match (setuid, uid_root, setgid, gid_root) {
        (false, _, false, _) => 0,
        (true, false, false, _) => 1,
        (true, false, true, false) => 2,
        (false, _, true, false) => 3,
        (false, _, true, true) => 4,
        (true, false, true, true) => 5,
        (true, true, false, _) => 6,
        (true, true, true, false) => 7,
        (true, true, true, true) => 8,
    }
}

/// `no-root ∧ bounding` strongest, `root-allowed ∧ ¬bounding` weakest.
fn security_score(options: &ResolvedOptions) -> u32 {
    match (options.no_root, options.bounding) {
        (true, true) => 0,
        (true, false) => 1,
        (false, true) => 2,
        (false, false) => 3,
    }
}

/// Options after walking document root → role → task.
struct ResolvedOptions {
    path: String,
    env_keep: Vec<String>,
    env_check: Vec<String>,
    no_root: bool,
    bounding: bool,
}

/// Merge one scope into an (allow-flag, enforced) pair. An enforced outer
/// denial cannot be weakened by an inner grant; strengthening is always
/// allowed.
fn merge_toggle(current: &mut (bool, bool), inner: Option<Toggle>) {
    if let Some(toggle) = inner {
        let (value, enforced) = *current;
        if enforced && toggle.value && !value {
            return;
        }
        *current = (toggle.value, toggle.enforce);
    }
}

fn resolve_options(policy: &Policy, role: &Role, task: &Task) -> ResolvedOptions {
    let scopes: [&OptionBlock; 3] = [&policy.options, &role.options, &task.options];

    let mut path = defaults::PATH.to_string();
    let mut env_keep: Vec<String> = defaults::ENV_KEEP.iter().map(|s| s.to_string()).collect();
    let mut env_check: Vec<String> = defaults::ENV_CHECK.iter().map(|s| s.to_string()).collect();
    // allow-root / allow-bounding as (allowed, enforced); defaults deny.
    let mut allow_root = (!defaults::NO_ROOT, false);
    let mut allow_bounding = (!defaults::BOUNDING, false);

    for scope in scopes {
        if let Some(p) = &scope.path {
            path = p.clone();
        }
        if let Some(keep) = &scope.env_keep {
            env_keep = keep.clone();
        }
        if let Some(check) = &scope.env_check {
            env_check = check.clone();
        }
        merge_toggle(&mut allow_root, scope.allow_root);
        merge_toggle(&mut allow_bounding, scope.allow_bounding);
    }

    ResolvedOptions {
        path,
        env_keep,
        env_check,
        no_root: !allow_root.0,
        bounding: !allow_bounding.0,
    }
}

fn build_settings(policy: &Policy, role: &Role, task: &Task) -> Settings {
    let resolved = resolve_options(policy, role, task);
    Settings {
        role_name: role.name.clone(),
        caps: task.caps.to_set(),
        target_user: task.setuser.clone(),
        target_groups: task.setgroups.clone(),
        no_root: resolved.no_root,
        bounding: resolved.bounding,
        path: resolved.path,
        env_keep: resolved.env_keep,
        env_check: resolved.env_check,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPattern;
    use crate::model::CapGrant;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn cmdline(path: &str, args: &[&str]) -> CommandLine {
        CommandLine {
            path: PathBuf::from(path),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn task(patterns: &[&str], caps: CapGrant) -> Task {
        Task {
            commands: patterns
                .iter()
                .map(|p| CommandPattern::parse(p).unwrap())
                .collect(),
            caps,
            setuser: None,
            setgroups: Vec::new(),
            options: OptionBlock::default(),
            unmatchable: None,
        }
    }

    fn role(name: &str, actors: Vec<Actor>, tasks: Vec<Task>) -> Role {
        Role {
            name: name.to_string(),
            actors,
            tasks,
            options: OptionBlock::default(),
        }
    }

    fn policy(roles: Vec<Role>) -> Policy {
        Policy {
            roles,
            options: OptionBlock::default(),
        }
    }

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn request<'a>(
        user: &'a str,
        groups: &'a [String],
        role: Option<&'a str>,
        command: &'a CommandLine,
    ) -> MatchRequest<'a> {
        MatchRequest {
            invoker_uid: 1000,
            user,
            groups,
            role,
            command,
        }
    }

    fn net_bind() -> CapGrant {
        let mut set = CapSet::empty();
        set.add(Cap::NET_BIND_SERVICE);
        CapGrant::Set(set)
    }

    #[test]
    fn exact_user_beats_group() {
        let cmd = cmdline("/bin/ls", &[]);
        let doc = policy(vec![
            role(
                "by-group",
                vec![Actor::GroupList(groups(&["adm"]))],
                vec![task(&["/bin/ls"], CapGrant::Empty)],
            ),
            role(
                "by-user",
                vec![Actor::User("alice".into())],
                vec![task(&["/bin/ls"], CapGrant::Empty)],
            ),
        ]);
        let gs = groups(&["adm"]);
        let outcome = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        assert_eq!(doc.role(outcome.role).name, "by-user");
    }

    #[test]
    fn strict_command_beats_wildcard() {
        let cmd = cmdline("/bin/ls", &["-l"]);
        let doc = policy(vec![role(
            "files",
            vec![Actor::User("alice".into())],
            vec![
                task(&["/bin/ls *"], CapGrant::Empty),
                task(&["/bin/ls -l"], CapGrant::Empty),
            ],
        )]);
        let gs = groups(&[]);
        let outcome = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        assert_eq!(outcome.task.task, 1);
    }

    #[test]
    fn fewer_caps_wins() {
        let cmd = cmdline("/usr/sbin/nginx", &[]);
        let doc = policy(vec![role(
            "web",
            vec![Actor::User("alice".into())],
            vec![
                task(&["/usr/sbin/nginx"], CapGrant::All),
                task(&["/usr/sbin/nginx"], net_bind()),
            ],
        )]);
        let gs = groups(&[]);
        let outcome = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        assert_eq!(outcome.task.task, 1);
    }

    #[test]
    fn identical_candidates_are_ambiguous() {
        let cmd = cmdline("/bin/ls", &[]);
        let doc = policy(vec![
            role(
                "one",
                vec![Actor::User("alice".into())],
                vec![task(&["/bin/ls"], CapGrant::Empty)],
            ),
            role(
                "two",
                vec![Actor::User("alice".into())],
                vec![task(&["/bin/ls"], CapGrant::Empty)],
            ),
        ]);
        let gs = groups(&[]);
        let err = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap_err();
        match err {
            MatchError::Ambiguous(names) => {
                assert_eq!(names.len(), 2);
                assert!(names[0].contains("one"));
                assert!(names[1].contains("two"));
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn requested_role_restricts_candidates() {
        let cmd = cmdline("/bin/ls", &[]);
        let doc = policy(vec![
            role(
                "wide",
                vec![Actor::User("alice".into())],
                vec![task(&["**"], CapGrant::Empty)],
            ),
            role(
                "narrow",
                vec![Actor::User("alice".into())],
                vec![task(&["/bin/ls"], CapGrant::Empty)],
            ),
        ]);
        let gs = groups(&[]);
        let outcome = find_task(&doc, &request("alice", &gs, Some("wide"), &cmd)).unwrap();
        assert_eq!(doc.role(outcome.role).name, "wide");

        let err = find_task(&doc, &request("alice", &gs, Some("absent"), &cmd)).unwrap_err();
        assert!(matches!(err, MatchError::RoleUnknown(_)));
    }

    #[test]
    fn unknown_actor_is_permission_denied() {
        let cmd = cmdline("/bin/ls", &[]);
        let doc = policy(vec![role(
            "files",
            vec![Actor::User("alice".into())],
            vec![task(&["/bin/ls"], CapGrant::Empty)],
        )]);
        let gs = groups(&[]);
        let err = find_task(&doc, &request("mallory", &gs, None, &cmd)).unwrap_err();
        assert!(matches!(err, MatchError::PermissionDenied));
    }

    #[test]
    fn root_invoker_matches_any_role() {
        let cmd = cmdline("/bin/ls", &[]);
        let doc = policy(vec![role(
            "files",
            vec![Actor::User("alice".into())],
            vec![task(&["/bin/ls"], CapGrant::Empty)],
        )]);
        let gs = groups(&[]);
        let req = MatchRequest {
            invoker_uid: 0,
            user: "root",
            groups: &gs,
            role: None,
            command: &cmd,
        };
        assert!(find_task(&doc, &req).is_ok());
    }

    #[test]
    fn full_group_cover_beats_partial() {
        let cmd = cmdline("/bin/ls", &[]);
        let doc = policy(vec![
            role(
                "partial",
                vec![Actor::GroupList(groups(&["adm"]))],
                vec![task(&["/bin/ls"], CapGrant::Empty)],
            ),
            role(
                "full",
                vec![Actor::GroupList(groups(&["adm", "wheel"]))],
                vec![task(&["/bin/ls"], CapGrant::Empty)],
            ),
        ]);
        let gs = groups(&["adm", "wheel"]);
        let outcome = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        assert_eq!(doc.role(outcome.role).name, "full");
    }

    #[test]
    fn unmatchable_task_is_skipped() {
        let cmd = cmdline("/bin/ls", &[]);
        let mut bad = task(&["/bin/ls"], CapGrant::Empty);
        bad.unmatchable = Some("cap_does_not_exist".into());
        let doc = policy(vec![role(
            "files",
            vec![Actor::User("alice".into())],
            vec![bad, task(&["/bin/ls *"], CapGrant::Empty)],
        )]);
        let gs = groups(&[]);
        let outcome = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        assert_eq!(outcome.task.task, 1);
    }

    #[test]
    fn enforced_root_denial_resists_task_grant() {
        let mut t = task(&["/bin/ls"], CapGrant::Empty);
        t.options.allow_root = Some(Toggle {
            value: true,
            enforce: false,
        });
        let mut doc = policy(vec![role(
            "files",
            vec![Actor::User("alice".into())],
            vec![t],
        )]);
        doc.options.allow_root = Some(Toggle {
            value: false,
            enforce: true,
        });

        let cmd = cmdline("/bin/ls", &[]);
        let gs = groups(&[]);
        let outcome = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        assert!(outcome.settings.no_root);
    }

    #[test]
    fn unenforced_root_denial_can_be_weakened() {
        let mut t = task(&["/bin/ls"], CapGrant::Empty);
        t.options.allow_root = Some(Toggle {
            value: true,
            enforce: false,
        });
        let mut doc = policy(vec![role(
            "files",
            vec![Actor::User("alice".into())],
            vec![t],
        )]);
        doc.options.allow_root = Some(Toggle {
            value: false,
            enforce: false,
        });

        let cmd = cmdline("/bin/ls", &[]);
        let gs = groups(&[]);
        let outcome = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        assert!(!outcome.settings.no_root);
    }

    #[test]
    fn task_options_override_role_and_root() {
        let mut t = task(&["/bin/ls"], CapGrant::Empty);
        t.options.path = Some("/task/bin".into());
        let mut r = role("files", vec![Actor::User("alice".into())], vec![t]);
        r.options.path = Some("/role/bin".into());
        let mut doc = policy(vec![r]);
        doc.options.path = Some("/root/bin".into());

        let cmd = cmdline("/bin/ls", &[]);
        let gs = groups(&[]);
        let outcome = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        assert_eq!(outcome.settings.path, "/task/bin");
    }

    #[test]
    fn stronger_security_options_break_ties() {
        let mut loose = task(&["/bin/ls"], CapGrant::Empty);
        loose.options.allow_root = Some(Toggle {
            value: true,
            enforce: false,
        });
        let strict = task(&["/bin/ls"], CapGrant::Empty);
        let doc = policy(vec![role(
            "files",
            vec![Actor::User("alice".into())],
            vec![loose, strict],
        )]);

        let cmd = cmdline("/bin/ls", &[]);
        let gs = groups(&[]);
        let outcome = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        assert_eq!(outcome.task.task, 1);
        assert!(outcome.settings.no_root);
    }

    #[test]
    fn match_is_pure() {
        let cmd = cmdline("/bin/ls", &[]);
        let doc = policy(vec![role(
            "files",
            vec![Actor::User("alice".into())],
            vec![task(&["/bin/ls"], CapGrant::Empty)],
        )]);
        let gs = groups(&[]);
        let a = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        let b = find_task(&doc, &request("alice", &gs, None, &cmd)).unwrap();
        assert_eq!(a.task, b.task);
        assert_eq!(a.settings, b.settings);
    }

    #[test]
    fn setuid_states_are_ordered() {
        let plain = task(&["/bin/ls"], CapGrant::Empty);
        assert_eq!(setuid_score(&plain), 0);

        let mut to_user = task(&["/bin/ls"], CapGrant::Empty);
        to_user.setuser = Some(TargetUser::Name("www-data".into()));
        assert_eq!(setuid_score(&to_user), 1);

        let mut to_root = task(&["/bin/ls"], CapGrant::Empty);
        to_root.setuser = Some(TargetUser::Id(0));
        assert_eq!(setuid_score(&to_root), 6);

        let mut worst = task(&["/bin/ls"], CapGrant::Empty);
        worst.setuser = Some(TargetUser::Name("root".into()));
        worst.setgroups = vec!["root".into()];
        assert_eq!(setuid_score(&worst), 8);
    }
}

//! End-to-end policy scenarios: document text in, resolved settings out.

use std::path::{Path, PathBuf};

use capctl::caps::Cap;
use pretty_assertions::assert_eq;

use sr_policy::env::filter_env;
use sr_policy::error::MatchError;
use sr_policy::matcher::{find_task, MatchRequest};
use sr_policy::{store, CommandLine};

fn cmdline(path: &str, args: &[&str]) -> CommandLine {
    CommandLine {
        path: PathBuf::from(path),
        args: args.iter().map(|s| s.to_string()).collect(),
    }
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

#[test]
fn least_privilege_bind_below_1024() {
    let policy = store::parse(
        r#"
<rootasrole>
  <role name="web">
    <user name="alice"/>
    <task>
      <command>/usr/sbin/nginx *</command>
      <capabilities>cap_net_bind_service</capabilities>
    </task>
  </role>
</rootasrole>
"#,
        Path::new("/test/policy.xml"),
    )
    .unwrap();

    let command = cmdline("/usr/sbin/nginx", &["-c", "/etc/nginx.conf"]);
    let groups: Vec<String> = vec![];
    let outcome = find_task(&policy, &request("alice", &groups, Some("web"), &command)).unwrap();

    let settings = outcome.settings;
    assert_eq!(settings.role_name, "web");
    assert!(settings.caps.has(Cap::NET_BIND_SERVICE));
    assert_eq!(settings.caps.iter().count(), 1);
    assert!(settings.no_root);
    assert!(settings.bounding);

    // The child environment: TZ pointing into the filesystem is stripped, a
    // zone name survives, and PATH becomes the policy value.
    let invoker_env = vec![
        ("TZ".to_string(), "/etc/shadow".to_string()),
        ("HOME".to_string(), "/home/alice".to_string()),
        ("PATH".to_string(), "/home/alice/bin".to_string()),
    ];
    let child_env = filter_env(
        &invoker_env,
        &settings.env_keep,
        &settings.env_check,
        &settings.path,
    );
    assert!(!child_env.iter().any(|(k, _)| k == "TZ"));
    assert!(child_env.contains(&("HOME".to_string(), "/home/alice".to_string())));
    assert!(child_env.contains(&("PATH".to_string(), settings.path.clone())));

    let safe_env = vec![("TZ".to_string(), "Europe/Paris".to_string())];
    let child_env = filter_env(
        &safe_env,
        &settings.env_keep,
        &settings.env_check,
        &settings.path,
    );
    assert!(child_env.contains(&("TZ".to_string(), "Europe/Paris".to_string())));
}

#[test]
fn identical_roles_are_reported_ambiguous() {
    let policy = store::parse(
        r#"
<rootasrole>
  <role name="first">
    <user name="alice"/>
    <task><command>/bin/ls</command></task>
  </role>
  <role name="second">
    <user name="alice"/>
    <task><command>/bin/ls</command></task>
  </role>
</rootasrole>
"#,
        Path::new("/test/policy.xml"),
    )
    .unwrap();

    let command = cmdline("/bin/ls", &[]);
    let groups: Vec<String> = vec![];
    let err = find_task(&policy, &request("alice", &groups, None, &command)).unwrap_err();
    match err {
        MatchError::Ambiguous(names) => {
            assert!(names.iter().any(|n| n.contains("first")));
            assert!(names.iter().any(|n| n.contains("second")));
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
}

#[test]
fn strict_pattern_beats_wildcard_across_roles() {
    let policy = store::parse(
        r#"
<rootasrole>
  <role name="loose">
    <user name="alice"/>
    <task><command>/bin/ls *</command></task>
  </role>
  <role name="tight">
    <user name="alice"/>
    <task><command>/bin/ls -l</command></task>
  </role>
</rootasrole>
"#,
        Path::new("/test/policy.xml"),
    )
    .unwrap();

    let command = cmdline("/bin/ls", &["-l"]);
    let groups: Vec<String> = vec![];
    let outcome = find_task(&policy, &request("alice", &groups, None, &command)).unwrap();
    assert_eq!(policy.role(outcome.role).name, "tight");
}

#[test]
fn group_conjunction_within_entry() {
    let policy = store::parse(
        r#"
<rootasrole>
  <role name="ops">
    <group names="adm,wheel"/>
    <task><command>/bin/ls</command></task>
  </role>
</rootasrole>
"#,
        Path::new("/test/policy.xml"),
    )
    .unwrap();

    let command = cmdline("/bin/ls", &[]);

    // Holding only one of the listed groups is not enough.
    let partial: Vec<String> = vec!["adm".to_string()];
    assert!(matches!(
        find_task(&policy, &request("bob", &partial, None, &command)).unwrap_err(),
        MatchError::PermissionDenied
    ));

    let full: Vec<String> = vec!["adm".to_string(), "wheel".to_string()];
    assert!(find_task(&policy, &request("bob", &full, None, &command)).is_ok());
}

#[test]
fn enforced_no_root_survives_task_override() {
    let policy = store::parse(
        r#"
<rootasrole>
  <options>
    <allow-root enforce="true">false</allow-root>
  </options>
  <role name="admin">
    <user name="alice"/>
    <task setuser="root">
      <command>/usr/bin/systemctl *</command>
      <options>
        <allow-root>true</allow-root>
      </options>
    </task>
  </role>
</rootasrole>
"#,
        Path::new("/test/policy.xml"),
    )
    .unwrap();

    let command = cmdline("/usr/bin/systemctl", &["restart", "nginx"]);
    let groups: Vec<String> = vec![];
    let outcome = find_task(&policy, &request("alice", &groups, None, &command)).unwrap();
    assert!(outcome.settings.no_root);
}

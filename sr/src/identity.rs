//! Invoker and target identity resolution over the user database.

use std::ffi::CString;
use std::path::PathBuf;

use nix::unistd::{getgrouplist, Group, Uid, User};
use thiserror::Error;

use sr_caps::TargetIds;
use sr_policy::model::TargetUser;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("cannot resolve uid {0} in the user database")]
    UnknownUid(u32),

    #[error("cannot resolve user {0:?} in the user database")]
    UnknownUser(String),

    #[error("cannot resolve group {0:?} in the group database")]
    UnknownGroup(String),

    #[error("user database lookup failed: {0}")]
    Lookup(String),
}

/// The authenticated caller: names for matching, ids and home for launching.
#[derive(Debug, Clone)]
pub struct Invoker {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    /// Primary group first, then supplementary groups, all by name.
    pub groups: Vec<String>,
    pub home: PathBuf,
}

/// Resolve the effective user of the current process.
pub fn current_invoker() -> Result<Invoker, IdentityError> {
    let uid = Uid::effective();
    let user = User::from_uid(uid)
        .map_err(|e| IdentityError::Lookup(e.to_string()))?
        .ok_or_else(|| IdentityError::UnknownUid(uid.as_raw()))?;

    let groups = group_names(&user)?;
    Ok(Invoker {
        uid: uid.as_raw(),
        gid: user.gid.as_raw(),
        name: user.name,
        groups,
        home: user.dir,
    })
}

/// All group names of a user, primary first.
fn group_names(user: &User) -> Result<Vec<String>, IdentityError> {
    let c_name = CString::new(user.name.as_bytes())
        .map_err(|_| IdentityError::Lookup("user name contains a null byte".into()))?;
    let gids = getgrouplist(&c_name, user.gid)
        .map_err(|e| IdentityError::Lookup(e.to_string()))?;

    let mut names = Vec::with_capacity(gids.len());
    for gid in gids {
        if let Some(group) = Group::from_gid(gid).map_err(|e| IdentityError::Lookup(e.to_string()))? {
            if !names.contains(&group.name) {
                names.push(group.name);
            }
        }
    }
    Ok(names)
}

/// Resolve a user by name. Used for the `-u` override.
pub fn lookup_user(name: &str) -> Result<User, IdentityError> {
    User::from_name(name)
        .map_err(|e| IdentityError::Lookup(e.to_string()))?
        .ok_or_else(|| IdentityError::UnknownUser(name.to_string()))
}

/// Resolve the target identity for the launcher: the task's `setuser` /
/// `setgroups`, with an optional `-u` override taking precedence.
///
/// Returns `None` when the session keeps the invoker's identity.
pub fn resolve_target(
    override_user: Option<&str>,
    setuser: Option<&TargetUser>,
    setgroups: &[String],
    invoker: &Invoker,
) -> Result<Option<TargetIds>, IdentityError> {
    let user = match (override_user, setuser) {
        (Some(name), _) => Some(lookup_user(name)?),
        (None, Some(TargetUser::Name(name))) => Some(lookup_user(name)?),
        (None, Some(TargetUser::Id(id))) => {
            let uid = Uid::from_raw(*id);
            Some(
                User::from_uid(uid)
                    .map_err(|e| IdentityError::Lookup(e.to_string()))?
                    .ok_or(IdentityError::UnknownUid(*id))?,
            )
        }
        (None, None) => None,
    };

    let groups: Vec<u32> = setgroups
        .iter()
        .map(|name| lookup_gid(name))
        .collect::<Result<_, _>>()?;

    match (user, groups.as_slice()) {
        (None, []) => Ok(None),
        (user, _) => {
            // A group-only change keeps the invoker's uid.
            let (uid, primary_gid) = match &user {
                Some(u) => (u.uid.as_raw(), u.gid.as_raw()),
                None => (invoker.uid, invoker.gid),
            };
            let (gid, supplementary) = match groups.split_first() {
                Some((first, rest)) => (*first, rest.to_vec()),
                None => (primary_gid, Vec::new()),
            };
            let mut all_groups = vec![gid];
            all_groups.extend(supplementary);
            Ok(Some(TargetIds {
                uid,
                gid,
                groups: all_groups,
            }))
        }
    }
}

/// Group name or numeric id to gid.
fn lookup_gid(name: &str) -> Result<u32, IdentityError> {
    if let Ok(id) = name.parse::<u32>() {
        return Ok(id);
    }
    Group::from_name(name)
        .map_err(|e| IdentityError::Lookup(e.to_string()))?
        .map(|g| g.gid.as_raw())
        .ok_or_else(|| IdentityError::UnknownGroup(name.to_string()))
}


//! Process identity and working directory changes.

use std::path::Path;

use nix::unistd::{self, Gid, Group, User};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Switch the process to `user` and `group`.
///
/// The group is changed first, while the process still has the privilege to
/// do so. Supplementary groups are dropped. An empty `group` selects the
/// primary group of `user`; an empty `user` keeps the current user. Nothing
/// happens when the process already runs with the target ids.
///
/// # Errors
///
/// Returns an error if a name cannot be resolved or a change is refused.
pub fn set_user_group(user: &str, group: &str) -> Result<()> {
    if user.is_empty() && group.is_empty() {
        return Ok(());
    }

    let target_user = if user.is_empty() {
        None
    } else {
        Some(lookup_user(user)?)
    };
    let gid = if group.is_empty() {
        target_user.as_ref().map(|u| u.gid)
    } else {
        Some(lookup_group(group)?)
    };
    let uid = target_user.as_ref().map(|u| u.uid);

    if gid.map_or(true, |g| g == unistd::getgid()) && uid.map_or(true, |u| u == unistd::getuid())
    {
        debug!(user, group, "Already running with the requested identity");
        return Ok(());
    }

    if let Some(gid) = gid {
        drop_supplementary_groups()?;
        unistd::setgid(gid).map_err(|e| {
            Error::io_with_source(format!("Failed to switch to group {gid}"), e)
        })?;
    }
    if let Some(uid) = uid {
        unistd::setuid(uid)
            .map_err(|e| Error::io_with_source(format!("Failed to switch to user {uid}"), e))?;
    }

    info!(user, group, uid = %unistd::getuid(), gid = %unistd::getgid(), "Process identity changed");
    Ok(())
}

fn lookup_user(name: &str) -> Result<User> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(Error::config(format!("Unknown user '{name}'"))),
        Err(e) => Err(Error::io_with_source(format!("Failed to look up user '{name}'"), e)),
    }
}

fn lookup_group(name: &str) -> Result<Gid> {
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid),
        Ok(None) => Err(Error::config(format!("Unknown group '{name}'"))),
        Err(e) => Err(Error::io_with_source(format!("Failed to look up group '{name}'"), e)),
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn drop_supplementary_groups() -> Result<()> {
    // Only root may touch the group list
    if !unistd::Uid::effective().is_root() {
        return Ok(());
    }
    unistd::setgroups(&[])
        .map_err(|e| Error::io_with_source("Failed to drop supplementary groups", e))
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn drop_supplementary_groups() -> Result<()> {
    Ok(())
}

/// Change the working directory. An empty path leaves it unchanged.
///
/// # Errors
///
/// Returns an error if the directory cannot be entered.
pub fn change_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    std::env::set_current_dir(path).map_err(|e| {
        Error::io_with_source(format!("Failed to change directory to {}", path.display()), e)
    })?;
    debug!(path = %path.display(), "Working directory changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_identity_is_noop() {
        assert!(set_user_group("", "").is_ok());
    }

    #[test]
    fn test_current_identity_is_noop() {
        let (Ok(Some(me)), Ok(Some(group))) = (
            User::from_uid(unistd::getuid()),
            Group::from_gid(unistd::getgid()),
        ) else {
            return;
        };
        assert!(set_user_group(&me.name, &group.name).is_ok());
        assert_eq!(unistd::getuid(), me.uid);
    }

    #[test]
    fn test_unknown_user_fails() {
        let err = set_user_group("no-such-user-for-detach-tests", "").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_unknown_group_fails() {
        let err = set_user_group("", "no-such-group-for-detach-tests").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_change_dir_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = change_dir(&missing).unwrap_err();
        assert_eq!(err.category(), "io");
        assert!(change_dir(Path::new("")).is_ok());
    }
}

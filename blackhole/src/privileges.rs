//! Post-bind privilege dropping.

use std::ffi::CString;

use blackhole_common::error::SupervisorError;
use blackhole_common::internal;
use nix::unistd::{initgroups, setgid, setuid, Gid, Group, Uid, User};

/// Switches to the configured group and user, in that order.
///
/// The group switch must happen first; once the user switch has completed
/// the process no longer has the privilege to change groups. Targets that
/// match the current credentials are skipped.
pub fn drop_privileges(
    user: Option<&str>,
    group: Option<&str>,
) -> Result<(), SupervisorError> {
    if let Some(name) = group {
        let group = resolve_group(name)?;
        if Gid::effective() == group.gid {
            internal!(level = DEBUG, "already running as group {}, skipping", name);
        } else {
            setgid(group.gid).map_err(|e| privilege_error(name, e))?;
            internal!(level = INFO, "dropped group privileges to {}", name);
        }
    }

    if let Some(name) = user {
        let user = resolve_user(name)?;
        if Uid::effective() == user.uid {
            internal!(level = DEBUG, "already running as user {}, skipping", name);
        } else {
            let cname = CString::new(name)
                .map_err(|_| privilege_error(name, nix::errno::Errno::EINVAL))?;
            if let Err(e) = initgroups(&cname, user.gid) {
                internal!(level = WARN, "failed to init groups for {}: {}", name, e);
            }
            setuid(user.uid).map_err(|e| privilege_error(name, e))?;
            internal!(level = INFO, "dropped user privileges to {}", name);
        }
    }

    Ok(())
}

fn resolve_user(name: &str) -> Result<User, SupervisorError> {
    User::from_name(name)
        .map_err(|e| privilege_error(name, e))?
        .ok_or_else(|| SupervisorError::PrivilegeDrop {
            target: name.to_owned(),
            reason: "user does not exist".to_owned(),
        })
}

fn resolve_group(name: &str) -> Result<Group, SupervisorError> {
    Group::from_name(name)
        .map_err(|e| privilege_error(name, e))?
        .ok_or_else(|| SupervisorError::PrivilegeDrop {
            target: name.to_owned(),
            reason: "group does not exist".to_owned(),
        })
}

fn privilege_error(target: &str, errno: nix::errno::Errno) -> SupervisorError {
    SupervisorError::PrivilegeDrop {
        target: target.to_owned(),
        reason: errno.to_string(),
    }
}

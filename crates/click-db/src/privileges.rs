use std::cell::Cell;
use std::fs;
use std::io;
use std::os::unix::fs::{chown, MetadataExt};
use std::path::{Path, PathBuf};

use click_core::{ClickError, IoResultExt, Result};
use tracing::debug;
use uzers::os::unix::UserExt;

/// Whether the process manages ownership and effective ids itself.
/// `Manage` is only meaningful when running as root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeMode {
    Manage,
    Inherit,
}

impl PrivilegeMode {
    pub fn detect() -> Self {
        if uzers::get_effective_uid() == 0 {
            Self::Manage
        } else {
            Self::Inherit
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

pub fn lookup_user(name: &str) -> Result<UserAccount> {
    let user =
        uzers::get_user_by_name(name).ok_or_else(|| ClickError::UnknownUser(name.to_string()))?;
    Ok(UserAccount {
        name: name.to_string(),
        uid: user.uid(),
        gid: user.primary_group_id(),
        home: user.home_dir().to_path_buf(),
    })
}

pub fn current_user_name() -> Result<String> {
    uzers::get_current_username()
        .and_then(|name| name.into_string().ok())
        .ok_or_else(|| ClickError::UnknownUser(format!("uid {}", uzers::get_current_uid())))
}

pub fn chown_to(path: &Path, account: &UserAccount) -> Result<()> {
    chown(path, Some(account.uid), Some(account.gid)).at_path(path)
}

/// Reference-counted effective uid/gid drop. Only the outermost guard
/// switches ids, so nested operations never regain root mid-way.
#[derive(Debug)]
pub struct PrivilegeDropper {
    account: Option<UserAccount>,
    depth: Cell<u32>,
}

impl PrivilegeDropper {
    /// A dropper that does nothing, for pseudo-users and unprivileged runs.
    pub fn inert() -> Self {
        Self {
            account: None,
            depth: Cell::new(0),
        }
    }

    pub fn for_account(account: UserAccount) -> Self {
        Self {
            account: Some(account),
            depth: Cell::new(0),
        }
    }

    pub fn drop_privileges(&self) -> Result<PrivilegeGuard<'_>> {
        let depth = self.depth.get();
        let mut switched = false;
        if depth == 0 {
            if let Some(account) = &self.account {
                set_effective_ids(account.uid, account.gid)?;
                debug!(user = %account.name, "dropped privileges");
                switched = true;
            }
        }
        self.depth.set(depth + 1);
        Ok(PrivilegeGuard {
            dropper: self,
            switched,
        })
    }
}

pub struct PrivilegeGuard<'a> {
    dropper: &'a PrivilegeDropper,
    switched: bool,
}

impl Drop for PrivilegeGuard<'_> {
    fn drop(&mut self) {
        let depth = self.dropper.depth.get().saturating_sub(1);
        self.dropper.depth.set(depth);
        if self.switched {
            if let Err(err) = set_effective_ids(0, 0) {
                tracing::error!(error = %err, "failed to regain privileges");
            }
        }
    }
}

fn set_effective_ids(uid: u32, gid: u32) -> Result<()> {
    // gid first: once the uid is dropped the gid can no longer be changed
    if uid == 0 {
        uzers::switch::set_effective_uid(0).map_err(switch_error)?;
        uzers::switch::set_effective_gid(gid).map_err(switch_error)
    } else {
        uzers::switch::set_effective_gid(gid).map_err(switch_error)?;
        uzers::switch::set_effective_uid(uid).map_err(switch_error)
    }
}

fn switch_error(err: io::Error) -> ClickError {
    ClickError::io("/proc/self", err)
}

/// Whether a given user may write into a path.
pub trait PermissionCheck {
    fn can_write(&self, path: &Path, user: &str) -> Result<bool>;
}

/// Decides from the mode bits of the nearest existing ancestor and the
/// user's group memberships.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModeBitsPermissionCheck;

impl PermissionCheck for ModeBitsPermissionCheck {
    fn can_write(&self, path: &Path, user: &str) -> Result<bool> {
        let account = lookup_user(user)?;
        if account.uid == 0 {
            return Ok(true);
        }
        let mut probe = Some(path);
        let metadata = loop {
            let Some(candidate) = probe else {
                return Ok(false);
            };
            match fs::metadata(candidate) {
                Ok(metadata) => break metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => probe = candidate.parent(),
                Err(err) => return Err(ClickError::io(candidate, err)),
            }
        };
        let mode = metadata.mode();
        if metadata.uid() == account.uid {
            return Ok(mode & 0o200 != 0);
        }
        let in_group = metadata.gid() == account.gid
            || uzers::get_user_groups(user, account.gid)
                .unwrap_or_default()
                .iter()
                .any(|group| group.gid() == metadata.gid());
        if in_group {
            return Ok(mode & 0o020 != 0);
        }
        Ok(mode & 0o002 != 0)
    }
}

pub fn check_permission(
    checker: &dyn PermissionCheck,
    path: &Path,
    user: &str,
) -> Result<()> {
    if checker.can_write(path, user)? {
        return Ok(());
    }
    Err(ClickError::PermissionDenied {
        path: path.to_path_buf(),
        reason: format!("user {user} cannot write here"),
    })
}

//! The layered click package database: installation roots, per-user
//! registrations, hooks and garbage collection, all kept as plain
//! directories and symlinks.

mod database;
mod fs_utils;
mod hooks;
mod layer;
mod privileges;
mod registry;
mod supervisor;

pub use database::{ClickDb, GcEntry, Registration, RegistrySnapshot};
pub use fs_utils::{
    ensure_dir, force_symlink, force_unlink, link_state, list_dir_or_empty, replace_symlink,
    LinkState,
};
pub use hooks::{expand_pattern, possible_expansion, HookDescriptor, HookEngine, RelevantApp};
pub use layer::{InstallationLayer, InstalledPackage, RemovalOutcome};
pub use privileges::{
    check_permission, chown_to, current_user_name, lookup_user, ModeBitsPermissionCheck,
    PermissionCheck, PrivilegeMode, UserAccount,
};
pub use registry::{
    is_pseudo_user, Lookup, UserRegistry, Users, ALL_USERS, GC_IN_USE_USER, HIDDEN_VERSION,
};
pub use supervisor::{AppSupervisor, IdleSupervisor, ProcessSupervisor};

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use click_core::{
    manifest_path, validate_package_name, validate_version, ClickError, Manifest, Result,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::database::{ClickDb, Registration, RegistrySnapshot};
use crate::fs_utils::{
    ensure_dir, force_symlink, force_unlink, link_state, list_dir_or_empty, remove_tree_no_follow,
    replace_symlink, target_basename, LinkState,
};
use crate::hooks::HookEngine;
use crate::privileges::{
    chown_to, current_user_name, lookup_user, PrivilegeDropper, PrivilegeGuard, PrivilegeMode,
    UserAccount,
};

/// Registrations that apply to every user.
pub const ALL_USERS: &str = "@all";
/// Versions whose removal was deferred because an app was running.
pub const GC_IN_USE_USER: &str = "@gcinuse";
/// Link target suppressing a package registered in a lower layer.
pub const HIDDEN_VERSION: &str = "@hidden";

pub fn is_pseudo_user(user: &str) -> bool {
    user.starts_with('@')
}

/// Outcome of resolving a package name in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Hidden,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound | Self::Hidden => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Self::Found(value) => Lookup::Found(f(value)),
            Self::NotFound => Lookup::NotFound,
            Self::Hidden => Lookup::Hidden,
        }
    }
}

/// One user's package-to-version selections, spanning every layer of the
/// database. Writes land in the overlay layer only.
#[derive(Debug)]
pub struct UserRegistry<'db> {
    db: &'db ClickDb,
    user: String,
    privileges: PrivilegeDropper,
}

impl<'db> UserRegistry<'db> {
    /// Registry for `user`, or for the user running the process.
    pub fn new(db: &'db ClickDb, user: Option<&str>) -> Result<Self> {
        let user = match user {
            Some(user) => user.to_string(),
            None => current_user_name()?,
        };
        let privileges = if db.privilege_mode() == PrivilegeMode::Manage && !is_pseudo_user(&user)
        {
            PrivilegeDropper::for_account(lookup_user(&user)?)
        } else {
            PrivilegeDropper::inert()
        };
        Ok(Self {
            db,
            user,
            privileges,
        })
    }

    pub fn all_users(db: &'db ClickDb) -> Self {
        Self {
            db,
            user: ALL_USERS.to_string(),
            privileges: PrivilegeDropper::inert(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_pseudo_user(&self) -> bool {
        is_pseudo_user(&self.user)
    }

    pub(crate) fn drop_privileges(&self) -> Result<PrivilegeGuard<'_>> {
        self.privileges.drop_privileges()
    }

    pub fn overlay_db(&self) -> Result<PathBuf> {
        Ok(self.db.overlay()?.user_db(&self.user))
    }

    /// Registry directories to consult, topmost layer first. Real users see
    /// their own entries before the `@all` entries of the same layer.
    fn user_dbs(&self) -> Vec<PathBuf> {
        let mut dbs = Vec::new();
        for layer in self.db.layers().iter().rev() {
            dbs.push(layer.user_db(&self.user));
            if !self.is_pseudo_user() {
                dbs.push(layer.user_db(ALL_USERS));
            }
        }
        dbs
    }

    fn resolve_link(&self, package: &str, skip: Option<&Path>) -> Result<Lookup<PathBuf>> {
        let _guard = self.drop_privileges()?;
        for db in self.user_dbs() {
            if skip == Some(db.as_path()) {
                continue;
            }
            let path = db.join(package);
            match link_state(&path) {
                LinkState::Valid(_) => return Ok(Lookup::Found(path)),
                LinkState::Marker(_) => return Ok(Lookup::Hidden),
                LinkState::Absent => {}
            }
        }
        Ok(Lookup::NotFound)
    }

    fn version_of_link(&self, link: &Path) -> Result<String> {
        let state = {
            let _guard = self.drop_privileges()?;
            link_state(link)
        };
        match state {
            LinkState::Valid(target) => {
                target_basename(&target).ok_or_else(|| ClickError::CorruptState {
                    path: link.to_path_buf(),
                    reason: "registration target has no version component".to_string(),
                })
            }
            _ => Err(ClickError::CorruptState {
                path: link.to_path_buf(),
                reason: "registration changed while reading".to_string(),
            }),
        }
    }

    pub fn lookup(&self, package: &str) -> Result<Lookup<String>> {
        match self.resolve_link(package, None)? {
            Lookup::Found(link) => Ok(Lookup::Found(self.version_of_link(&link)?)),
            Lookup::NotFound => Ok(Lookup::NotFound),
            Lookup::Hidden => Ok(Lookup::Hidden),
        }
    }

    pub fn get_version(&self, package: &str) -> Result<String> {
        match self.lookup(package)? {
            Lookup::Found(version) => Ok(version),
            Lookup::NotFound => Err(self.no_such_package(package)),
            Lookup::Hidden => Err(self.hidden_package(package)),
        }
    }

    pub fn has_package_name(&self, package: &str) -> Result<bool> {
        Ok(self.lookup(package)?.is_found())
    }

    /// Path of the registry symlink that resolves `package`.
    pub fn path(&self, package: &str) -> Result<PathBuf> {
        match self.resolve_link(package, None)? {
            Lookup::Found(link) => Ok(link),
            Lookup::NotFound => Err(self.no_such_package(package)),
            Lookup::Hidden => Err(self.hidden_package(package)),
        }
    }

    /// Visible package names, sorted. Links whose target has no version
    /// component are skipped.
    pub fn package_names(&self) -> Result<Vec<String>> {
        let _guard = self.drop_privileges()?;
        let mut decided = BTreeSet::new();
        let mut names = BTreeSet::new();
        for db in self.user_dbs() {
            for entry in list_dir_or_empty(&db)? {
                if entry.starts_with('.') || !decided.insert(entry.clone()) {
                    continue;
                }
                let LinkState::Valid(target) = link_state(&db.join(&entry)) else {
                    continue;
                };
                if target_basename(&target).is_none() {
                    warn!(
                        package = %entry,
                        user = %self.user,
                        "skipping registration without a version"
                    );
                    continue;
                }
                names.insert(entry);
            }
        }
        Ok(names.into_iter().collect())
    }

    /// `(package, version)` for every visible registration. A corrupt
    /// registration is logged and left out.
    pub fn versions(&self) -> Result<Vec<(String, String)>> {
        let mut versions = Vec::new();
        for package in self.package_names()? {
            match self.lookup(&package) {
                Ok(Lookup::Found(version)) => versions.push((package, version)),
                Ok(Lookup::NotFound | Lookup::Hidden) => {}
                Err(err @ ClickError::CorruptState { .. }) => {
                    warn!(
                        package = %package,
                        user = %self.user,
                        error = %err,
                        "skipping corrupt registration"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(versions)
    }

    /// Whether [`UserRegistry::remove`] could act on `package`.
    pub fn is_removable(&self, package: &str) -> Result<bool> {
        let overlay = self.db.overlay()?;
        let mut dbs = vec![overlay.user_db(&self.user)];
        if !self.is_pseudo_user() {
            dbs.push(overlay.user_db(ALL_USERS));
        }
        {
            let _guard = self.drop_privileges()?;
            for db in dbs {
                match link_state(&db.join(package)) {
                    LinkState::Valid(_) => return Ok(true),
                    LinkState::Marker(_) => return Ok(false),
                    LinkState::Absent => {}
                }
            }
        }
        Ok(self.lookup(package)?.is_found())
    }

    /// Create the overlay registry directory, handing newly created
    /// control directories to the service user and the user directory to
    /// the registry's user.
    fn ensure_db(&self) -> Result<()> {
        let overlay = self.db.overlay()?;
        let manage = self.db.privilege_mode() == PrivilegeMode::Manage;
        let users_dir = overlay.users_dir();

        let mut missing = Vec::new();
        let mut probe = Some(users_dir.as_path());
        while let Some(path) = probe {
            if path.exists() {
                break;
            }
            missing.push(path.to_path_buf());
            probe = path.parent();
        }
        if !missing.is_empty() {
            let service = if manage {
                Some(lookup_user(&self.db.config().service_user)?)
            } else {
                None
            };
            for path in missing.iter().rev() {
                ensure_dir(path)?;
                if let Some(account) = &service {
                    chown_to(path, account)?;
                }
            }
        }

        let user_db = overlay.user_db(&self.user);
        if !user_db.exists() {
            ensure_dir(&user_db)?;
            if manage && !self.is_pseudo_user() {
                chown_to(&user_db, &self.account()?)?;
            }
        }
        Ok(())
    }

    fn account(&self) -> Result<UserAccount> {
        lookup_user(&self.user)
    }

    /// Select `version` of `package` for this user and re-project hooks.
    pub fn set_version(&self, package: &str, version: &str) -> Result<()> {
        validate_package_name(package)?;
        validate_version(version)?;
        let target = self.db.path(package, version)?;
        let old_version = match self.lookup(package) {
            Ok(lookup) => lookup.found(),
            Err(err) => {
                warn!(package, error = %err, "previous registration unreadable");
                None
            }
        };

        self.ensure_db()?;
        let overlay_db = self.overlay_db()?;
        let link = overlay_db.join(package);
        {
            let _guard = self.drop_privileges()?;
            let overlay_state = link_state(&link);
            let underlay = if matches!(overlay_state, LinkState::Marker(_)) {
                Lookup::NotFound
            } else {
                self.resolve_link(package, Some(&overlay_db))?
            };
            let underlay_version = match underlay {
                Lookup::Found(found) => Some(self.version_of_link(&found)?),
                Lookup::NotFound | Lookup::Hidden => None,
            };

            if underlay_version.as_deref() == Some(version) {
                force_unlink(&link)?;
                debug!(package, version, user = %self.user, "registration collapses onto lower layer");
            } else if overlay_state != LinkState::Valid(target.clone()) {
                let staging = overlay_db.join(format!(".{package}.new"));
                replace_symlink(&target, &link, &staging)?;
                info!(package, version, user = %self.user, "registered package version");
            }
        }

        if !self.is_pseudo_user() {
            HookEngine::new(self.db).run_install_hooks(
                package,
                old_version.as_deref(),
                Some(version),
                Some(&self.user),
            )?;
        }
        Ok(())
    }

    /// Unregister `package`, returning the version that was selected.
    /// A registration that a lower layer would re-expose is hidden rather
    /// than deleted.
    pub fn remove(&self, package: &str) -> Result<String> {
        validate_package_name(package)?;
        let overlay_db = self.overlay_db()?;
        let link = overlay_db.join(package);
        let state = {
            let _guard = self.drop_privileges()?;
            link_state(&link)
        };

        let old_version = match &state {
            LinkState::Valid(_) => self.version_of_link(&link)?,
            LinkState::Marker(_) => return Err(self.no_such_package(package)),
            LinkState::Absent => match self.lookup(package)? {
                Lookup::Found(version) => version,
                Lookup::NotFound | Lookup::Hidden => return Err(self.no_such_package(package)),
            },
        };

        // Apps go down while the registration still resolves.
        if !self.is_pseudo_user() {
            self.stop_apps(package, &old_version)?;
        }

        match state {
            LinkState::Valid(target) => {
                let _guard = self.drop_privileges()?;
                if self.points_into_underlay(&target)? {
                    force_symlink(Path::new(HIDDEN_VERSION), &link)?;
                    info!(package, version = %old_version, user = %self.user, "hid registration from lower layer");
                } else {
                    force_unlink(&link)?;
                    info!(package, version = %old_version, user = %self.user, "unregistered package");
                }
            }
            LinkState::Marker(_) | LinkState::Absent => {
                self.ensure_db()?;
                let _guard = self.drop_privileges()?;
                force_symlink(Path::new(HIDDEN_VERSION), &link)?;
                info!(package, version = %old_version, user = %self.user, "hid registration from lower layer");
            }
        }

        if !self.is_pseudo_user() {
            HookEngine::new(self.db).run_remove_hooks(package, &old_version, Some(&self.user))?;
            self.remove_cache_dir(package)?;
        }
        Ok(old_version)
    }

    fn points_into_underlay(&self, target: &Path) -> Result<bool> {
        let overlay = self.db.overlay()?;
        if target.starts_with(overlay.root()) {
            return Ok(false);
        }
        let layers = self.db.layers();
        Ok(layers[..layers.len() - 1]
            .iter()
            .any(|layer| target.starts_with(layer.root())))
    }

    fn stop_apps(&self, package: &str, version: &str) -> Result<()> {
        let apps = match self.db.app_names(package, version) {
            Ok(apps) => apps,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        for app_name in apps {
            self.db.supervisor().stop(package, &app_name, version)?;
        }
        Ok(())
    }

    fn cache_dir(&self, package: &str) -> Result<Option<PathBuf>> {
        if self.user == current_user_name().unwrap_or_default() {
            if let Some(cache) = dirs::cache_dir() {
                return Ok(Some(cache.join(package)));
            }
        }
        match self.account() {
            Ok(account) => Ok(Some(account.home.join(".cache").join(package))),
            Err(ClickError::UnknownUser(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn remove_cache_dir(&self, package: &str) -> Result<()> {
        let Some(cache) = self.cache_dir(package)? else {
            return Ok(());
        };
        let _guard = self.drop_privileges()?;
        remove_tree_no_follow(&cache)?;
        debug!(path = %cache.display(), "removed package cache");
        Ok(())
    }

    /// Manifest of the registered version, with `_directory` naming the
    /// registry link and `_removable` as 0 or 1.
    pub fn manifest(&self, package: &str) -> Result<Value> {
        let link = self.path(package)?;
        let version = self.version_of_link(&link)?;
        let dir = self.db.path(package, &version)?;
        let mut object = Manifest::read(&manifest_path(&dir, package))?.to_json_object();
        object.insert(
            "_directory".to_string(),
            Value::String(link.to_string_lossy().into_owned()),
        );
        let removable = u8::from(self.is_removable(package)?);
        object.insert("_removable".to_string(), Value::from(removable));
        Ok(Value::Object(object))
    }

    /// Manifests of every registered package; unreadable ones are skipped.
    pub fn manifests(&self) -> Result<Vec<Value>> {
        let mut manifests = Vec::new();
        for package in self.package_names()? {
            match self.manifest(&package) {
                Ok(manifest) => manifests.push(manifest),
                Err(err) if matches!(err, ClickError::BadManifest { .. }) || err.is_not_found() => {
                    warn!(package = %package, error = %err, "skipping unreadable manifest");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(manifests)
    }

    fn no_such_package(&self, package: &str) -> ClickError {
        ClickError::NoSuchPackage {
            package: package.to_string(),
            user: self.user.clone(),
        }
    }

    fn hidden_package(&self, package: &str) -> ClickError {
        ClickError::HiddenPackage {
            package: package.to_string(),
            user: self.user.clone(),
        }
    }
}

/// Every registry in the database.
#[derive(Debug, Clone, Copy)]
pub struct Users<'db> {
    db: &'db ClickDb,
}

impl<'db> Users<'db> {
    pub fn new(db: &'db ClickDb) -> Self {
        Self { db }
    }

    /// User names with a registry directory in any layer, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        for layer in self.db.layers() {
            let users_dir = layer.users_dir();
            for entry in list_dir_or_empty(&users_dir)? {
                if users_dir.join(&entry).is_dir() {
                    names.insert(entry);
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    pub fn get(&self, user: &str) -> Result<UserRegistry<'db>> {
        if !self.names()?.iter().any(|name| name == user) {
            return Err(ClickError::UnknownUser(user.to_string()));
        }
        if user == ALL_USERS {
            return Ok(UserRegistry::all_users(self.db));
        }
        UserRegistry::new(self.db, Some(user))
    }
}

impl RegistrySnapshot for Users<'_> {
    fn registrations(&self) -> Result<Vec<Registration>> {
        let mut registrations = Vec::new();
        for user in self.names()? {
            let registry = self.get(&user)?;
            for (package, version) in registry.versions()? {
                registrations.push(Registration {
                    user: user.clone(),
                    package,
                    version,
                });
            }
        }
        Ok(registrations)
    }
}

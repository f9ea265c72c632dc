use std::fs;
use std::path::{Path, PathBuf};

use click_core::{manifest_path, IoResultExt, Manifest, Result};
use tracing::{debug, info, warn};

use crate::fs_utils::{
    ensure_dir, force_symlink, force_unlink, list_dir_or_empty, read_link_if_exists,
    remove_dir_if_empty, target_basename,
};
use crate::supervisor::AppSupervisor;
use crate::GC_IN_USE_USER;

/// One installed `(package, version)` as seen through a layer or the
/// layered database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub package: String,
    pub version: String,
    pub path: PathBuf,
    /// True when the entry comes from the writable overlay layer.
    pub writeable: bool,
}

/// Result of asking a layer to drop one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    Removed,
    /// An app from the version is running; removal was deferred and recorded
    /// under the in-use marker.
    InUse,
    /// A real registration still selects the version.
    Registered,
    Absent,
}

/// A single database root: `<root>/<package>/<version>/`,
/// `<root>/<package>/current` and `<root>/.click/users/<user>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationLayer {
    root: PathBuf,
}

impl InstallationLayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.root.join(package)
    }

    pub fn version_dir(&self, package: &str, version: &str) -> PathBuf {
        self.package_dir(package).join(version)
    }

    pub fn current_link(&self, package: &str) -> PathBuf {
        self.package_dir(package).join("current")
    }

    pub fn control_dir(&self) -> PathBuf {
        self.root.join(".click")
    }

    pub fn users_dir(&self) -> PathBuf {
        self.control_dir().join("users")
    }

    pub fn user_db(&self, user: &str) -> PathBuf {
        self.users_dir().join(user)
    }

    pub fn has_package_version(&self, package: &str, version: &str) -> bool {
        self.version_dir(package, version).is_dir()
    }

    pub fn resolve(&self, package: &str, version: &str) -> Option<PathBuf> {
        let path = self.version_dir(package, version);
        path.is_dir().then_some(path)
    }

    /// Version named by `current`. A target with a path separator is
    /// treated as absent.
    pub fn current_version(&self, package: &str) -> Result<Option<String>> {
        let link = self.current_link(package);
        let Some(target) = read_link_if_exists(&link)? else {
            return Ok(None);
        };
        match target.to_str() {
            Some(version) if !version.contains('/') && !version.is_empty() => {
                Ok(Some(version.to_string()))
            }
            _ => {
                warn!(path = %link.display(), "ignoring malformed current link");
                Ok(None)
            }
        }
    }

    /// Installed packages, sorted by name then version. With
    /// `all_versions` false, one entry per package whose `current` is
    /// valid, located at the `current` link.
    pub fn enumerate(&self, all_versions: bool) -> Result<Vec<InstalledPackage>> {
        let mut packages = Vec::new();
        for package in list_dir_or_empty(&self.root)? {
            if package == ".click" {
                continue;
            }
            let package_dir = self.package_dir(&package);
            if !package_dir.is_dir() {
                continue;
            }
            if all_versions {
                for version in list_dir_or_empty(&package_dir)? {
                    let path = package_dir.join(&version);
                    let is_real_dir = fs::symlink_metadata(&path)
                        .map(|metadata| metadata.is_dir())
                        .unwrap_or(false);
                    if !is_real_dir {
                        continue;
                    }
                    packages.push(InstalledPackage {
                        package: package.clone(),
                        version,
                        path,
                        writeable: false,
                    });
                }
            } else if let Some(version) = self.current_version(&package)? {
                packages.push(InstalledPackage {
                    package: package.clone(),
                    version,
                    path: self.current_link(&package),
                    writeable: false,
                });
            }
        }
        Ok(packages)
    }

    /// App names declared in the version's manifest. An unreadable
    /// manifest yields no apps.
    pub fn app_names(&self, package: &str, version: &str) -> Vec<String> {
        let path = manifest_path(&self.version_dir(package, version), package);
        match Manifest::read_hooks(&path) {
            Ok(hooks) => hooks.into_keys().collect(),
            Err(err) => {
                debug!(package, version, error = %err, "no readable manifest hooks");
                Vec::new()
            }
        }
    }

    pub fn any_app_running(
        &self,
        package: &str,
        version: &str,
        supervisor: &dyn AppSupervisor,
    ) -> Result<bool> {
        for app_name in self.app_names(package, version) {
            if supervisor.is_running(package, &app_name, version)? {
                debug!(package, version, app = %app_name, "app is running");
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn in_use_link(&self, package: &str) -> PathBuf {
        self.user_db(GC_IN_USE_USER).join(package)
    }

    pub fn mark_in_use(&self, package: &str, version: &str) -> Result<()> {
        let db = self.user_db(GC_IN_USE_USER);
        ensure_dir(&db)?;
        force_symlink(&self.version_dir(package, version), &self.in_use_link(package))?;
        info!(package, version, "deferring removal of running version");
        Ok(())
    }

    /// Drop the in-use marker when it records `version`.
    pub fn clear_in_use(&self, package: &str, version: &str) -> Result<bool> {
        let link = self.in_use_link(package);
        let Some(target) = read_link_if_exists(&link)? else {
            return Ok(false);
        };
        if target_basename(&target).as_deref() != Some(version) {
            return Ok(false);
        }
        force_unlink(&link)?;
        Ok(true)
    }

    /// Delete the version tree without any reference checks. A `current`
    /// link naming it is removed and not repointed; an emptied package
    /// directory is removed too.
    pub fn remove_version(&self, package: &str, version: &str) -> Result<()> {
        let version_dir = self.version_dir(package, version);
        fs::remove_dir_all(&version_dir).at_path(&version_dir)?;
        if self.current_version(package)?.as_deref() == Some(version) {
            force_unlink(&self.current_link(package))?;
        }
        remove_dir_if_empty(&self.package_dir(package))?;
        info!(package, version, root = %self.root.display(), "removed package version");
        Ok(())
    }

    /// Remove the version unless an app from it is running, in which case
    /// the in-use marker records it for a later pass. `before_remove` runs
    /// only when the tree is about to be deleted.
    pub fn remove_version_if_unreferenced(
        &self,
        package: &str,
        version: &str,
        supervisor: &dyn AppSupervisor,
        before_remove: impl FnOnce() -> Result<()>,
    ) -> Result<RemovalOutcome> {
        if !self.has_package_version(package, version) {
            return Ok(RemovalOutcome::Absent);
        }
        if self.any_app_running(package, version, supervisor)? {
            self.mark_in_use(package, version)?;
            return Ok(RemovalOutcome::InUse);
        }
        before_remove()?;
        self.remove_version(package, version)?;
        Ok(RemovalOutcome::Removed)
    }
}

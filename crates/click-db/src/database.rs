use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::os::unix::fs::{lchown, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use click_core::{
    manifest_path, read_database_roots, ClickConfig, ClickError, IoResultExt, Manifest, Result,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::hooks::HookEngine;
use crate::layer::{InstallationLayer, InstalledPackage, RemovalOutcome};
use crate::privileges::{lookup_user, PrivilegeMode};
use crate::supervisor::{AppSupervisor, ProcessSupervisor};
use crate::GC_IN_USE_USER;

/// One `(user, package, version)` selection across every registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Registration {
    pub user: String,
    pub package: String,
    pub version: String,
}

/// Source of the current registrations consulted before removing a version.
pub trait RegistrySnapshot {
    fn registrations(&self) -> Result<Vec<Registration>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcEntry {
    pub package: String,
    pub version: String,
    pub outcome: RemovalOutcome,
}

/// The ordered stack of installation layers. The last layer is the
/// writable overlay.
pub struct ClickDb {
    layers: Vec<InstallationLayer>,
    config: ClickConfig,
    supervisor: Arc<dyn AppSupervisor>,
    privileges: PrivilegeMode,
}

impl std::fmt::Debug for ClickDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickDb")
            .field("layers", &self.layers)
            .field("config", &self.config)
            .field("privileges", &self.privileges)
            .finish_non_exhaustive()
    }
}

impl ClickDb {
    /// An empty database; add layers with [`ClickDb::add`].
    pub fn new(config: ClickConfig) -> Self {
        Self {
            layers: Vec::new(),
            config,
            supervisor: Arc::new(ProcessSupervisor),
            privileges: PrivilegeMode::detect(),
        }
    }

    /// Layers from `<db_dir>/*.conf`, lowest first.
    pub fn read(config: ClickConfig) -> Result<Self> {
        let roots = read_database_roots(&config.db_dir)?;
        let mut db = Self::new(config);
        for root in roots {
            db.add(root);
        }
        debug!(layers = db.layers.len(), "read click database configuration");
        Ok(db)
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn AppSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_privilege_mode(mut self, mode: PrivilegeMode) -> Self {
        self.privileges = mode;
        self
    }

    pub fn add(&mut self, root: impl Into<PathBuf>) {
        self.layers.push(InstallationLayer::new(root));
    }

    pub fn config(&self) -> &ClickConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &dyn AppSupervisor {
        self.supervisor.as_ref()
    }

    pub fn privilege_mode(&self) -> PrivilegeMode {
        self.privileges
    }

    pub fn layers(&self) -> &[InstallationLayer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn overlay(&self) -> Result<&InstallationLayer> {
        self.layers.last().ok_or(ClickError::NoDatabase)
    }

    /// Version directory from the topmost layer that has it.
    pub fn path(&self, package: &str, version: &str) -> Result<PathBuf> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.resolve(package, version))
            .ok_or_else(|| ClickError::not_found(package, version))
    }

    pub fn has_package_version(&self, package: &str, version: &str) -> bool {
        self.path(package, version).is_ok()
    }

    /// Installed packages across layers, the higher layer winning on name
    /// (or name and version with `all_versions`).
    pub fn packages(&self, all_versions: bool) -> Result<Vec<InstalledPackage>> {
        let mut seen = BTreeSet::new();
        let mut packages = Vec::new();
        let top = self.layers.len().saturating_sub(1);
        for (index, layer) in self.layers.iter().enumerate().rev() {
            for mut package in layer.enumerate(all_versions)? {
                let key = if all_versions {
                    (package.package.clone(), package.version.clone())
                } else {
                    (package.package.clone(), String::new())
                };
                if !seen.insert(key) {
                    continue;
                }
                package.writeable = index == top;
                packages.push(package);
            }
        }
        Ok(packages)
    }

    pub fn manifest(&self, package: &str, version: &str) -> Result<Manifest> {
        let dir = self.path(package, version)?;
        Manifest::read(&manifest_path(&dir, package))
    }

    /// Manifest as a JSON object with `_directory` added.
    pub fn manifest_report(&self, package: &str, version: &str) -> Result<Value> {
        let dir = self.path(package, version)?;
        let mut object = Manifest::read(&manifest_path(&dir, package))?.to_json_object();
        object.insert(
            "_directory".to_string(),
            Value::String(dir.to_string_lossy().into_owned()),
        );
        Ok(Value::Object(object))
    }

    pub fn app_names(&self, package: &str, version: &str) -> Result<Vec<String>> {
        let layer = self.layer_with(package, version)?;
        Ok(layer.app_names(package, version))
    }

    pub fn any_app_running(&self, package: &str, version: &str) -> Result<bool> {
        let layer = self.layer_with(package, version)?;
        layer.any_app_running(package, version, self.supervisor())
    }

    fn layer_with(&self, package: &str, version: &str) -> Result<&InstallationLayer> {
        self.layers
            .iter()
            .rev()
            .find(|layer| layer.has_package_version(package, version))
            .ok_or_else(|| ClickError::not_found(package, version))
    }

    /// Remove `(package, version)` from the overlay unless some registration
    /// still selects it or one of its apps is running.
    pub fn maybe_remove(
        &self,
        snapshot: &dyn RegistrySnapshot,
        package: &str,
        version: &str,
    ) -> Result<RemovalOutcome> {
        let overlay = self.overlay()?;
        let mut deferred = false;
        for registration in snapshot.registrations()? {
            if registration.package != package || registration.version != version {
                continue;
            }
            if registration.user == GC_IN_USE_USER {
                deferred = true;
                continue;
            }
            debug!(package, version, user = %registration.user, "version still registered");
            return Ok(RemovalOutcome::Registered);
        }
        if deferred {
            overlay.clear_in_use(package, version)?;
        }
        overlay.remove_version_if_unreferenced(package, version, self.supervisor(), || {
            HookEngine::new(self).run_remove_hooks(package, version, None)
        })
    }

    /// Run [`ClickDb::maybe_remove`] over every version in the overlay.
    pub fn gc(&self, snapshot: &dyn RegistrySnapshot) -> Result<Vec<GcEntry>> {
        let overlay = self.overlay()?;
        let mut entries = Vec::new();
        for installed in overlay.enumerate(true)? {
            let outcome = self.maybe_remove(snapshot, &installed.package, &installed.version)?;
            entries.push(GcEntry {
                package: installed.package,
                version: installed.version,
                outcome,
            });
        }
        Ok(entries)
    }

    /// Give the overlay tree to the service user. No-op unless managing
    /// privileges, or when the root already has the right owner.
    pub fn ensure_ownership(&self) -> Result<()> {
        if self.privileges != PrivilegeMode::Manage {
            return Ok(());
        }
        let overlay = self.overlay()?;
        let account = lookup_user(&self.config.service_user)?;
        let root = overlay.root();
        let metadata = fs::metadata(root).at_path(root)?;
        if metadata.uid() == account.uid && metadata.gid() == account.gid {
            return Ok(());
        }
        chown_tree(root, account.uid, account.gid)?;
        info!(root = %root.display(), user = %account.name, "fixed overlay ownership");
        Ok(())
    }
}

fn chown_tree(root: &Path, uid: u32, gid: u32) -> Result<()> {
    let mut pending = VecDeque::from([root.to_path_buf()]);
    while let Some(path) = pending.pop_front() {
        lchown(&path, Some(uid), Some(gid)).at_path(&path)?;
        let metadata = fs::symlink_metadata(&path).at_path(&path)?;
        if !metadata.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&path).at_path(&path)? {
            pending.push_back(entry.at_path(&path)?.path());
        }
    }
    Ok(())
}

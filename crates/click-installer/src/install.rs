use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::{lchown, PermissionsExt};
use std::path::{Path, PathBuf};

use click_core::{
    validate_package_name, validate_version, ClickError, IoResultExt, Manifest, Result,
};
use click_db::{
    check_permission, chown_to, current_user_name, ensure_dir, force_symlink, lookup_user,
    ClickDb, HookEngine, ModeBitsPermissionCheck, PermissionCheck, PrivilegeMode,
    RemovalOutcome, UserRegistry, Users,
};
use tracing::{debug, info, warn};

use crate::frameworks::validate_framework;
use crate::unpack::{seed_admin_dir, DpkgUnpacker, UnpackRequest, Unpacker};

/// Who gets the freshly installed version registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationTarget {
    Nobody,
    User(String),
    AllUsers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub package: String,
    pub version: String,
    /// Version `current` named before this install.
    pub old_version: Option<String>,
    /// False when a lower layer already provided the version.
    pub unpacked: bool,
    /// What happened to `old_version` afterwards.
    pub superseded: Option<RemovalOutcome>,
}

struct Unpacked {
    package: String,
    version: String,
    old_version: Option<String>,
    unpacked: bool,
}

/// Unpacks archives into the overlay layer and wires them into the
/// database: hooks, `current`, registration and cleanup of the version it
/// replaces.
pub struct ClickInstaller<'db> {
    db: &'db ClickDb,
    unpacker: Box<dyn Unpacker + 'db>,
    permissions: Box<dyn PermissionCheck + 'db>,
    force_missing_framework: bool,
}

impl<'db> ClickInstaller<'db> {
    pub fn new(db: &'db ClickDb) -> Self {
        Self {
            db,
            unpacker: Box::new(DpkgUnpacker),
            permissions: Box::new(ModeBitsPermissionCheck),
            force_missing_framework: false,
        }
    }

    pub fn with_unpacker(mut self, unpacker: impl Unpacker + 'db) -> Self {
        self.unpacker = Box::new(unpacker);
        self
    }

    pub fn with_permission_check(mut self, permissions: impl PermissionCheck + 'db) -> Self {
        self.permissions = Box::new(permissions);
        self
    }

    pub fn force_missing_framework(mut self, force: bool) -> Self {
        self.force_missing_framework = force;
        self
    }

    /// Read and validate the archive's manifest.
    pub fn audit(&self, archive: &Path) -> Result<Manifest> {
        let manifest = self.unpacker.inspect(archive)?;
        validate_package_name(&manifest.name)?;
        validate_version(&manifest.version)?;
        let Some(framework) = manifest.framework.as_deref() else {
            return Err(ClickError::Framework(
                "No \"framework\" entry in manifest".to_string(),
            ));
        };
        validate_framework(self.db.config(), framework, self.force_missing_framework)?;
        Ok(manifest)
    }

    pub fn install(&self, archive: &Path, target: &RegistrationTarget) -> Result<InstallOutcome> {
        let unpacked = self.unpack(archive)?;

        match target {
            RegistrationTarget::Nobody => {}
            RegistrationTarget::User(user) => {
                UserRegistry::new(self.db, Some(user))?
                    .set_version(&unpacked.package, &unpacked.version)?;
            }
            RegistrationTarget::AllUsers => {
                UserRegistry::all_users(self.db)
                    .set_version(&unpacked.package, &unpacked.version)?;
            }
        }

        let superseded = match unpacked.old_version.as_deref() {
            Some(old) if old != unpacked.version => {
                let outcome = self
                    .db
                    .maybe_remove(&Users::new(self.db), &unpacked.package, old)?;
                debug!(package = %unpacked.package, version = old, ?outcome, "checked superseded version");
                Some(outcome)
            }
            _ => None,
        };

        Ok(InstallOutcome {
            package: unpacked.package,
            version: unpacked.version,
            old_version: unpacked.old_version,
            unpacked: unpacked.unpacked,
            superseded,
        })
    }

    fn unpack(&self, archive: &Path) -> Result<Unpacked> {
        let manifest = self.audit(archive)?;
        let package = manifest.name;
        let version = manifest.version;
        let overlay = self.db.overlay()?;

        if self.db.has_package_version(&package, &version)
            && !overlay.has_package_version(&package, &version)
        {
            info!(package = %package, version = %version, "already provided by a lower layer");
            return Ok(Unpacked {
                package,
                version,
                old_version: None,
                unpacked: false,
            });
        }

        let manage = self.db.privilege_mode() == PrivilegeMode::Manage;
        let service = if manage {
            Some(lookup_user(&self.db.config().service_user)?)
        } else {
            None
        };
        let writer = match &service {
            Some(account) => account.name.clone(),
            None => current_user_name()?,
        };
        check_permission(self.permissions.as_ref(), overlay.root(), &writer)?;

        let control_dir = overlay.control_dir();
        if !control_dir.exists() {
            ensure_dir(&control_dir)?;
            if let Some(account) = &service {
                chown_to(&control_dir, account)?;
            }
        }

        let inst_dir = overlay.version_dir(&package, &version);
        let admin_dir = inst_dir.join(".click");
        if seed_admin_dir(&admin_dir)? {
            if let Some(account) = &service {
                for path in [overlay.package_dir(&package), inst_dir.clone(), admin_dir.clone()] {
                    chown_to(&path, account)?;
                }
            }
        }

        let log_path = control_dir.join("log");
        self.unpacker.unpack(&UnpackRequest {
            archive,
            inst_dir: &inst_dir,
            admin_dir: &admin_dir,
            log_path: &log_path,
            base_dir: overlay.root(),
            run_as: service.as_ref(),
            preload: self.db.config().preload_library.as_deref(),
        })?;
        relax_permissions(&inst_dir)?;

        let old_version = overlay.current_version(&package)?;
        HookEngine::new(self.db).run_install_hooks(
            &package,
            old_version.as_deref(),
            Some(&version),
            None,
        )?;

        let current = overlay.current_link(&package);
        let staging = overlay.package_dir(&package).join("current.new");
        force_symlink(Path::new(&version), &staging)?;
        if let Some(account) = &service {
            lchown(&staging, Some(account.uid), Some(account.gid)).at_path(&staging)?;
        }
        fs::rename(&staging, &current).at_path(&current)?;
        info!(package = %package, version = %version, old_version = ?old_version, "installed package");

        Ok(Unpacked {
            package,
            version,
            old_version,
            unpacked: true,
        })
    }
}

/// Make everything under `root` group/other readable, and executable where
/// the owner can execute. Failures are logged and skipped.
fn relax_permissions(root: &Path) -> Result<()> {
    let mut pending: VecDeque<PathBuf> = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = pending.pop_front() {
        for entry in fs::read_dir(&dir).at_path(&dir)? {
            let path = entry.at_path(&dir)?.path();
            let metadata = fs::symlink_metadata(&path).at_path(&path)?;
            if metadata.file_type().is_symlink() {
                continue;
            }
            if metadata.is_dir() {
                pending.push_back(path.clone());
            }
            let mode = metadata.permissions().mode();
            let mut relaxed = mode | 0o044;
            if mode & 0o100 != 0 {
                relaxed |= 0o011;
            }
            if relaxed != mode {
                if let Err(err) = fs::set_permissions(&path, fs::Permissions::from_mode(relaxed)) {
                    warn!(path = %path.display(), error = %err, "could not relax permissions");
                }
            }
        }
    }
    Ok(())
}

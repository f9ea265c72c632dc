use std::ffi::OsString;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use click_core::{ClickError, IoResultExt, Manifest, Result};
use click_db::UserAccount;
use tracing::{debug, info};

/// Everything the unpacker needs to extract one archive.
#[derive(Debug, Clone, Copy)]
pub struct UnpackRequest<'a> {
    pub archive: &'a Path,
    pub inst_dir: &'a Path,
    pub admin_dir: &'a Path,
    pub log_path: &'a Path,
    /// Overlay root, exported to the preload library.
    pub base_dir: &'a Path,
    pub run_as: Option<&'a UserAccount>,
    pub preload: Option<&'a Path>,
}

/// Reads and extracts package archives.
pub trait Unpacker {
    /// The archive's manifest, read without extracting it.
    fn inspect(&self, archive: &Path) -> Result<Manifest>;

    fn unpack(&self, request: &UnpackRequest<'_>) -> Result<()>;
}

/// Extracts with `dpkg` into a private admin directory per version.
#[derive(Debug, Default, Clone, Copy)]
pub struct DpkgUnpacker;

impl Unpacker for DpkgUnpacker {
    fn inspect(&self, archive: &Path) -> Result<Manifest> {
        let output = Command::new("dpkg-deb")
            .arg("-I")
            .arg(archive)
            .arg("manifest")
            .output()
            .at_path(archive)?;
        if !output.status.success() {
            return Err(ClickError::Unpack {
                archive: archive.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        Manifest::from_json_str(&raw).map_err(|reason| ClickError::Unpack {
            archive: archive.to_path_buf(),
            reason: format!("bad manifest: {reason}"),
        })
    }

    fn unpack(&self, request: &UnpackRequest<'_>) -> Result<()> {
        let mut command = Command::new("dpkg");
        command
            .arg("--force-not-root")
            .arg("--force-bad-path")
            .arg("--force-architecture")
            .arg("--instdir")
            .arg(request.inst_dir)
            .arg("--admindir")
            .arg(request.admin_dir)
            .arg("--path-exclude")
            .arg("*/.click/*")
            .arg("--log")
            .arg(request.log_path)
            .arg("--no-triggers")
            .arg("--install")
            .arg(request.archive)
            .env("CLICK_BASE_DIR", request.base_dir)
            .env("CLICK_PACKAGE_PATH", request.archive)
            .env_remove("HOME");
        if let Some(preload) = request.preload {
            let mut preloads = OsString::from(preload.as_os_str());
            if let Some(existing) = std::env::var_os("LD_PRELOAD") {
                preloads.push(" ");
                preloads.push(existing);
            }
            command.env("LD_PRELOAD", preloads);
        }
        if let Some(account) = request.run_as {
            command.uid(account.uid).gid(account.gid);
        }

        info!(archive = %request.archive.display(), inst_dir = %request.inst_dir.display(), "unpacking");
        let output = command.output().at_path(request.archive)?;
        if !output.status.success() {
            return Err(ClickError::Unpack {
                archive: request.archive.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(archive = %request.archive.display(), "dpkg finished");
        Ok(())
    }
}

/// Create the per-version dpkg admin area if it does not exist yet.
pub fn seed_admin_dir(admin_dir: &Path) -> Result<bool> {
    if admin_dir.exists() {
        return Ok(false);
    }
    fs::create_dir_all(admin_dir).at_path(admin_dir)?;
    for file in ["available", "status"] {
        let path = admin_dir.join(file);
        fs::write(&path, "").at_path(&path)?;
    }
    for dir in ["info", "updates", "triggers"] {
        let path = admin_dir.join(dir);
        fs::create_dir(&path).at_path(&path)?;
    }
    Ok(true)
}

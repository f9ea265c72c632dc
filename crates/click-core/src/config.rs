use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClickError, IoResultExt, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/click/click.toml";
pub const DATABASE_SECTION: &str = "Click Database";

/// Paths and accounts the database, hook engine and installer work with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClickConfig {
    pub db_dir: PathBuf,
    pub hooks_dir: PathBuf,
    pub frameworks_dir: PathBuf,
    pub service_user: String,
    pub default_root: PathBuf,
    pub preload_library: Option<PathBuf>,
}

impl Default for ClickConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("/etc/click/databases"),
            hooks_dir: PathBuf::from("/usr/share/click/hooks"),
            frameworks_dir: PathBuf::from("/usr/share/click/frameworks"),
            service_user: "clickpkg".to_string(),
            default_root: PathBuf::from("/opt/click.ubuntu.com"),
            preload_library: None,
        }
    }
}

impl ClickConfig {
    pub fn from_toml_str(input: &str, origin: &Path) -> Result<Self> {
        toml::from_str(input).map_err(|err| ClickError::Config {
            path: origin.to_path_buf(),
            reason: err.to_string(),
        })
    }

    /// Load `path` (or the default location), falling back to defaults when
    /// the file does not exist, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw, path)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no click config file; using defaults");
                Self::default()
            }
            Err(err) => return Err(ClickError::io(path, err)),
        };
        config.apply_env(|key| std::env::var_os(key));
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<std::ffi::OsString>) {
        if let Some(value) = lookup("CLICK_DB_DIR") {
            self.db_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("CLICK_HOOKS_DIR") {
            self.hooks_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("CLICK_FRAMEWORKS_DIR") {
            self.frameworks_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("CLICK_PACKAGE_PRELOAD") {
            self.preload_library = Some(PathBuf::from(value));
        }
    }

    pub fn hook_path(&self, name: &str) -> PathBuf {
        self.hooks_dir.join(format!("{name}.hook"))
    }

    pub fn framework_path(&self, name: &str) -> PathBuf {
        self.frameworks_dir.join(format!("{name}.framework"))
    }
}

/// Parse one database configuration file and return its `root`.
pub fn parse_database_conf(raw: &str) -> std::result::Result<PathBuf, String> {
    let mut in_section = false;
    let mut root = None;
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[') {
            let Some(section) = section.strip_suffix(']') else {
                return Err(format!("line {}: malformed section header", index + 1));
            };
            in_section = section.trim() == DATABASE_SECTION;
            continue;
        }
        let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
            return Err(format!("line {}: expected key = value", index + 1));
        };
        if in_section && key.trim() == "root" {
            root = Some(PathBuf::from(value.trim()));
        }
    }
    root.ok_or_else(|| format!("no 'root' option in section [{DATABASE_SECTION}]"))
}

/// Roots of every configured database layer, lowest first. Files are
/// consumed in sorted filename order; unparseable files are skipped.
pub fn read_database_roots(db_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(db_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(ClickError::io(db_dir, err)),
    };

    let mut conf_paths = Vec::new();
    for entry in entries {
        let entry = entry.at_path(db_dir)?;
        let path = entry.path();
        if path.extension().and_then(|value| value.to_str()) == Some("conf") {
            conf_paths.push(path);
        }
    }
    conf_paths.sort();

    let mut roots = Vec::with_capacity(conf_paths.len());
    for path in conf_paths {
        let raw = fs::read_to_string(&path).at_path(&path)?;
        match parse_database_conf(&raw) {
            Ok(root) => roots.push(root),
            Err(reason) => {
                warn!(path = %path.display(), %reason, "skipping database configuration");
            }
        }
    }
    Ok(roots)
}

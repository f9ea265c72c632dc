use std::collections::BTreeSet;

use click_core::{ClickConfig, ClickError, Deb822Fields, Result};
use click_db::list_dir_or_empty;
use tracing::warn;

/// A `<frameworks_dir>/<name>.framework` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framework {
    pub name: String,
    pub base_version: Option<String>,
}

impl Framework {
    pub fn open(config: &ClickConfig, name: &str) -> Result<Option<Self>> {
        let path = config.framework_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let fields = Deb822Fields::read(&path)?;
        Ok(Some(Self {
            name: name.to_string(),
            base_version: fields.get("base-version").map(str::to_string),
        }))
    }
}

pub fn list_frameworks(config: &ClickConfig) -> Result<Vec<Framework>> {
    let mut frameworks = Vec::new();
    for entry in list_dir_or_empty(&config.frameworks_dir)? {
        let Some(name) = entry.strip_suffix(".framework") else {
            continue;
        };
        if let Some(framework) = Framework::open(config, name)? {
            frameworks.push(framework);
        }
    }
    Ok(frameworks)
}

fn parse_framework_names(framework: &str) -> Result<Vec<&str>> {
    let mut names = Vec::new();
    for entry in framework.split(',') {
        let entry = entry.trim();
        if entry.contains('|') {
            return Err(ClickError::Framework(format!(
                "Alternative dependencies in framework \"{framework}\" not yet allowed"
            )));
        }
        if entry.contains('(') || entry.contains(')') {
            return Err(ClickError::Framework(format!(
                "Version relationship in framework \"{framework}\" not yet allowed"
            )));
        }
        if entry.is_empty() || entry.contains(char::is_whitespace) {
            return Err(ClickError::Framework(format!(
                "Could not parse framework \"{framework}\""
            )));
        }
        names.push(entry);
    }
    Ok(names)
}

/// Check a manifest's `framework` entry against the installed frameworks.
pub fn validate_framework(
    config: &ClickConfig,
    framework: &str,
    ignore_missing: bool,
) -> Result<()> {
    let mut missing = Vec::new();
    let mut base_versions = BTreeSet::new();
    for name in parse_framework_names(framework)? {
        match Framework::open(config, name)? {
            Some(found) => {
                base_versions.insert(found.base_version);
            }
            None => missing.push(format!("\"{name}\"")),
        }
    }

    if !missing.is_empty() {
        let listed = missing.join(", ");
        if !ignore_missing {
            let noun = if missing.len() > 1 {
                "Frameworks"
            } else {
                "Framework"
            };
            return Err(ClickError::Framework(format!(
                "{noun} {listed} not present on system (use --force-missing-framework option to override)"
            )));
        }
        warn!(frameworks = %listed, "ignoring missing frameworks");
    }

    if base_versions.len() > 1 {
        let found: Vec<String> = base_versions
            .into_iter()
            .map(|version| version.unwrap_or_else(|| "none".to_string()))
            .collect();
        return Err(ClickError::Framework(format!(
            "Multiple frameworks with different base versions are not allowed. Found: {}",
            found.join(", ")
        )));
    }
    Ok(())
}

use crate::error::{ClickError, Result};

/// Characters that would make `<package>_<app>_<version>` ambiguous or
/// escape a database directory.
const FORBIDDEN: [char; 2] = ['/', '_'];

pub fn validate_package_name(name: &str) -> Result<()> {
    validate_component("package name", name)
}

pub fn validate_version(version: &str) -> Result<()> {
    validate_component("version", version)
}

pub fn validate_app_name(app_name: &str) -> Result<()> {
    validate_component("application name", app_name)
}

fn validate_component(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ClickError::InvalidIdentifier {
            field,
            value: value.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    if value == "." || value == ".." {
        return Err(ClickError::InvalidIdentifier {
            field,
            value: value.to_string(),
            reason: "must not be a relative directory name".to_string(),
        });
    }
    if let Some(ch) = value.chars().find(|ch| FORBIDDEN.contains(ch)) {
        return Err(ClickError::InvalidIdentifier {
            field,
            value: value.to_string(),
            reason: format!("may not contain '{ch}'"),
        });
    }
    Ok(())
}

/// `<package>_<app>`
pub fn short_app_id(package: &str, app_name: &str) -> Result<String> {
    validate_app_name(app_name)?;
    Ok(format!("{package}_{app_name}"))
}

/// `<package>_<app>_<version>`
pub fn app_id(package: &str, version: &str, app_name: &str) -> Result<String> {
    Ok(format!("{}_{version}", short_app_id(package, app_name)?))
}

/// Split an app id back into `(package, app, version)`. The version is the
/// remainder after the second underscore.
pub fn split_app_id(id: &str) -> Option<(&str, &str, &str)> {
    let mut parts = id.splitn(3, '_');
    let package = parts.next()?;
    let app_name = parts.next()?;
    let version = parts.next()?;
    Some((package, app_name, version))
}

//! Shared types for the click package database: error kinds, the package
//! manifest, identifier rules and configuration.

mod config;
mod deb822;
mod error;
mod ident;
mod manifest;

pub use config::{
    parse_database_conf, read_database_roots, ClickConfig, DATABASE_SECTION, DEFAULT_CONFIG_PATH,
};
pub use deb822::Deb822Fields;
pub use error::{ClickError, IoResultExt, Result};
pub use ident::{
    app_id, short_app_id, split_app_id, validate_app_name, validate_package_name,
    validate_version,
};
pub use manifest::{manifest_path, strip_dynamic_keys, Manifest, ManifestHooks};

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use click_core::{ClickError, IoResultExt, Result};

/// State of a registration or `current` symlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// A symlink to a real path.
    Valid(PathBuf),
    /// A symlink to an `@`-prefixed pseudo target such as `@hidden`.
    Marker(String),
    Absent,
}

pub fn link_state(path: &Path) -> LinkState {
    match fs::read_link(path) {
        Ok(target) => match target.to_str() {
            Some(raw) if raw.starts_with('@') => LinkState::Marker(raw.to_string()),
            _ => LinkState::Valid(target),
        },
        Err(_) => LinkState::Absent,
    }
}

pub fn read_link_if_exists(path: &Path) -> Result<Option<PathBuf>> {
    match fs::read_link(path) {
        Ok(target) => Ok(Some(target)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        // not a symlink
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(None),
        Err(err) => Err(ClickError::io(path, err)),
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(ClickError::CorruptState {
            path: path.to_path_buf(),
            reason: "expected a directory".to_string(),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path).at_path(path)
        }
        Err(err) => Err(ClickError::io(path, err)),
    }
}

/// Remove a file or symlink, succeeding when nothing is there.
pub fn force_unlink(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ClickError::io(path, err)),
    }
}

pub fn force_symlink(target: &Path, link: &Path) -> Result<()> {
    force_unlink(link)?;
    symlink(target, link).at_path(link)
}

/// Point `link` at `target` by writing `staging` first and renaming it into
/// place, so readers never observe a missing link.
pub fn replace_symlink(target: &Path, link: &Path, staging: &Path) -> Result<()> {
    force_symlink(target, staging)?;
    fs::rename(staging, link).at_path(link)
}

/// Entry names of `path`, sorted. A missing path reads as empty; any other
/// read failure, including `path` not being a directory, is an error.
pub fn list_dir_or_empty(path: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(ClickError::io(path, err)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.at_path(path)?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Delete `path` without following a symlink at any level.
pub fn remove_tree_no_follow(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(ClickError::io(path, err)),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path).at_path(path)
    } else {
        fs::remove_file(path).at_path(path)
    }
}

pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if !list_dir_or_empty(path)?.is_empty() {
        return Ok(false);
    }
    match fs::remove_dir(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ClickError::io(path, err)),
    }
}

/// Final path component of a link target, as a version string.
pub fn target_basename(target: &Path) -> Option<String> {
    target
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

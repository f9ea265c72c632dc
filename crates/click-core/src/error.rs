use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds surfaced by the click database, registry, hook and
/// installer layers.
#[derive(Debug, Error)]
pub enum ClickError {
    #[error("{package} {version} does not exist in any database")]
    NotFound { package: String, version: String },

    #[error("{package} does not exist in any database for user {user}")]
    NoSuchPackage { package: String, user: String },

    #[error("{package} is hidden for user {user}")]
    HiddenPackage { package: String, user: String },

    #[error("invalid {field} '{value}': {reason}")]
    InvalidIdentifier {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("permission denied for {}: {reason}", path.display())]
    PermissionDenied { path: PathBuf, reason: String },

    #[error("corrupt state at {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("failed to read manifest {}: {reason}", path.display())]
    BadManifest { path: PathBuf, reason: String },

    #[error("no click databases are configured")]
    NoDatabase,

    #[error("user '{0}' does not exist")]
    UnknownUser(String),

    #[error("no click hook '{0}' installed")]
    HookNotFound(String),

    #[error("hook '{hook}' failed: {reason}")]
    HookFailed { hook: String, reason: String },

    #[error("failed to unpack {}: {reason}", archive.display())]
    Unpack { archive: PathBuf, reason: String },

    #[error("{0}")]
    Framework(String),

    #[error("invalid configuration {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ClickError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            return Self::PermissionDenied {
                path: path.into(),
                reason: source.to_string(),
            };
        }
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(package: &str, version: &str) -> Self {
        Self::NotFound {
            package: package.to_string(),
            version: version.to_string(),
        }
    }

    /// True for every "the thing asked for is not there" kind, including a
    /// hidden registration.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::NoSuchPackage { .. } | Self::HiddenPackage { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ClickError>;

/// Attach a path to a raw `io::Result`.
pub trait IoResultExt<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|err| ClickError::io(path, err))
    }
}

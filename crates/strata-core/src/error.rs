//! Error taxonomy for reconciliation runs.

use std::path::PathBuf;

use thiserror::Error;

use crate::remote::RemoteError;

/// Result alias used throughout the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors a reconciliation or feature run can surface.
#[derive(Debug, Error)]
pub enum Error {
    /// A local directory, feature, or unit does not exist.
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    /// The remote reported an unexpected status.
    #[error("remote access failed ({status}): {message}")]
    RemoteAccess { status: u16, message: String },

    /// The calling identity may not provision the state store.
    #[error("{0}")]
    Permission(String),

    /// The remote schema was provisioned by a newer engine.
    #[error(
        "remote {scope} schema version {remote} is newer than this engine supports ({expected}); upgrade strata"
    )]
    VersionSkew {
        scope: &'static str,
        remote: u32,
        expected: u32,
    },

    /// Bootstrap is required but the caller disallowed it.
    #[error(
        "{scope} bootstrap is required for identity '{identity}' but bootstrapping is disabled"
    )]
    BootstrapRequired {
        scope: &'static str,
        identity: String,
    },

    /// A unit script does not expose anything runnable.
    #[error("invalid unit '{unit}': {reason}")]
    InvalidUnit { unit: String, reason: String },

    /// A unit or its archive import failed.
    #[error("unit '{unit}' failed: {source:#}")]
    UnitExecution {
        unit: String,
        #[source]
        source: anyhow::Error,
    },

    /// A lifecycle hook failed outside of the recoverable paths.
    #[error("hook '{hook}' failed: {source:#}")]
    Hook {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Local filesystem failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Archive packaging failure.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// A remote attribute or local document could not be decoded.
    #[error("failed to decode {what}: {message}")]
    Decode { what: String, message: String },

    /// Invalid local configuration (descriptor, exclusion pattern, overrides).
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn decode(what: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        Self::RemoteAccess {
            status: err.status,
            message: err.message,
        }
    }
}

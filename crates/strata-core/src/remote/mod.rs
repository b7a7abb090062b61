//! Remote target access.
//!
//! The engine talks to the target through [`RemoteApi`], a generic
//! read/patch/create/delete surface over two record kinds:
//! - a single global preferences record (key/value attributes)
//! - a searchable custom object collection keyed by name
//!
//! plus the archive-import side channel and plain file/code uploads.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub use http::HttpRemote;
pub use memory::MemoryRemote;

/// Attribute bag exchanged with the remote.
pub type Attributes = Map<String, Value>;

/// Failure reported by the remote (or the transport in front of it).
///
/// `status` is the HTTP-like status code; `0` means no response was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub status: u16,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn is_forbidden(&self) -> bool {
        self.status == 403
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// 403 and 404 both mean "not provisioned or not visible to this identity".
    pub fn is_absent(&self) -> bool {
        self.is_forbidden() || self.is_not_found()
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {}: {}", self.status, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// A custom object as returned by the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub key: String,
    pub attributes: Attributes,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// Descriptive information about the connected target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInfo {
    pub server: String,
    pub code_version: Option<String>,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    fn info(&self) -> TargetInfo;

    async fn get_preferences(&self) -> Result<Attributes, RemoteError>;

    /// Merge `attributes` into the preferences record.
    async fn patch_preferences(&self, attributes: Attributes) -> Result<(), RemoteError>;

    async fn get_object(&self, object_type: &str, key: &str) -> Result<RemoteObject, RemoteError>;

    async fn search_objects(&self, object_type: &str) -> Result<Vec<RemoteObject>, RemoteError>;

    async fn create_object(
        &self,
        object_type: &str,
        key: &str,
        attributes: Attributes,
    ) -> Result<(), RemoteError>;

    async fn patch_object(
        &self,
        object_type: &str,
        key: &str,
        attributes: Attributes,
    ) -> Result<(), RemoteError>;

    async fn delete_object(&self, object_type: &str, key: &str) -> Result<(), RemoteError>;

    /// Import a zip bundle as one unit of work.
    async fn import_archive(&self, name: &str, archive: Vec<u8>) -> Result<(), RemoteError>;

    /// Upload an arbitrary file (used by the log sink).
    async fn upload_file(&self, path: &str, body: Vec<u8>) -> Result<(), RemoteError>;

    /// Upload a zipped code artifact.
    async fn upload_code(&self, name: &str, archive: Vec<u8>) -> Result<(), RemoteError>;
}

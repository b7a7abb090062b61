//! In-memory [`RemoteApi`] implementation.
//!
//! Used by tests and embedders. Semantics follow the
//! remote contract closely enough for the engine: a missing preferences
//! record answers 404, a forbidden one 403, and any successful archive
//! import provisions the preferences record.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Attributes, RemoteApi, RemoteError, RemoteObject, TargetInfo};
use crate::archive;

/// One archive received by the import channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub name: String,
    pub entries: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    preferences: Option<Attributes>,
    forbidden: bool,
    objects: BTreeMap<String, BTreeMap<String, RemoteObject>>,
    imports: Vec<ImportRecord>,
    files: BTreeMap<String, Vec<u8>>,
    code: BTreeMap<String, Vec<u8>>,
    import_failure: Option<RemoteError>,
    upload_failure: Option<RemoteError>,
    preference_writes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryRemote {
    server: String,
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    /// A target whose preferences record does not exist yet.
    pub fn new() -> Self {
        Self {
            server: "memory".to_string(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// A target with an empty, readable preferences record.
    pub fn provisioned() -> Self {
        Self::with_preferences(Attributes::new())
    }

    pub fn with_preferences(preferences: Attributes) -> Self {
        let remote = Self::new();
        remote.lock().preferences = Some(preferences);
        remote
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer 403 on every preferences access.
    pub fn set_forbidden(&self, forbidden: bool) {
        self.lock().forbidden = forbidden;
    }

    /// Fail every subsequent archive import with `error`.
    pub fn fail_imports(&self, error: RemoteError) {
        self.lock().import_failure = Some(error);
    }

    /// Fail every subsequent file upload with `error`.
    pub fn fail_uploads(&self, error: RemoteError) {
        self.lock().upload_failure = Some(error);
    }

    pub fn preferences(&self) -> Option<Attributes> {
        self.lock().preferences.clone()
    }

    /// Number of successful preferences patches so far.
    pub fn preference_writes(&self) -> usize {
        self.lock().preference_writes
    }

    pub fn imports(&self) -> Vec<ImportRecord> {
        self.lock().imports.clone()
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.lock().files.clone()
    }

    pub fn code_uploads(&self) -> Vec<String> {
        self.lock().code.keys().cloned().collect()
    }

    pub fn object(&self, object_type: &str, key: &str) -> Option<RemoteObject> {
        self.lock()
            .objects
            .get(object_type)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    pub fn insert_object(&self, object_type: &str, key: &str, attributes: Attributes) {
        let now = chrono::Utc::now();
        self.lock()
            .objects
            .entry(object_type.to_string())
            .or_default()
            .insert(
                key.to_string(),
                RemoteObject {
                    key: key.to_string(),
                    attributes,
                    created_at: Some(now),
                    last_modified_at: Some(now),
                },
            );
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    fn info(&self) -> TargetInfo {
        TargetInfo {
            server: self.server.clone(),
            code_version: None,
        }
    }

    async fn get_preferences(&self) -> Result<Attributes, RemoteError> {
        let state = self.lock();
        if state.forbidden {
            return Err(RemoteError::forbidden("access to preferences denied"));
        }
        state
            .preferences
            .clone()
            .ok_or_else(|| RemoteError::not_found("preferences not found"))
    }

    async fn patch_preferences(&self, attributes: Attributes) -> Result<(), RemoteError> {
        let mut state = self.lock();
        if state.forbidden {
            return Err(RemoteError::forbidden("access to preferences denied"));
        }
        let preferences = state
            .preferences
            .as_mut()
            .ok_or_else(|| RemoteError::not_found("preferences not found"))?;
        preferences.extend(attributes);
        state.preference_writes += 1;
        Ok(())
    }

    async fn get_object(&self, object_type: &str, key: &str) -> Result<RemoteObject, RemoteError> {
        self.object(object_type, key)
            .ok_or_else(|| RemoteError::not_found(format!("{object_type} '{key}' not found")))
    }

    async fn search_objects(&self, object_type: &str) -> Result<Vec<RemoteObject>, RemoteError> {
        Ok(self
            .lock()
            .objects
            .get(object_type)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_object(
        &self,
        object_type: &str,
        key: &str,
        attributes: Attributes,
    ) -> Result<(), RemoteError> {
        if self.object(object_type, key).is_some() {
            return Err(RemoteError::new(
                409,
                format!("{object_type} '{key}' already exists"),
            ));
        }
        self.insert_object(object_type, key, attributes);
        Ok(())
    }

    async fn patch_object(
        &self,
        object_type: &str,
        key: &str,
        attributes: Attributes,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let object = state
            .objects
            .get_mut(object_type)
            .and_then(|objects| objects.get_mut(key))
            .ok_or_else(|| RemoteError::not_found(format!("{object_type} '{key}' not found")))?;
        object.attributes.extend(attributes);
        object.last_modified_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn delete_object(&self, object_type: &str, key: &str) -> Result<(), RemoteError> {
        self.lock()
            .objects
            .get_mut(object_type)
            .and_then(|objects| objects.remove(key))
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(format!("{object_type} '{key}' not found")))
    }

    async fn import_archive(&self, name: &str, archive: Vec<u8>) -> Result<(), RemoteError> {
        let entries = archive::entry_names(&archive)
            .map_err(|e| RemoteError::new(400, format!("invalid archive: {e}")))?;

        let mut state = self.lock();
        if let Some(error) = &state.import_failure {
            return Err(error.clone());
        }
        if state.preferences.is_none() {
            state.preferences = Some(Attributes::new());
        }
        state.imports.push(ImportRecord {
            name: name.to_string(),
            entries,
        });
        Ok(())
    }

    async fn upload_file(&self, path: &str, body: Vec<u8>) -> Result<(), RemoteError> {
        let mut state = self.lock();
        if let Some(error) = &state.upload_failure {
            return Err(error.clone());
        }
        state.files.insert(path.to_string(), body);
        Ok(())
    }

    async fn upload_code(&self, name: &str, archive: Vec<u8>) -> Result<(), RemoteError> {
        self.lock().code.insert(name.to_string(), archive);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_preferences_answer_not_found() {
        let remote = MemoryRemote::new();
        let err = remote.get_preferences().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn forbidden_preferences_answer_forbidden() {
        let remote = MemoryRemote::provisioned();
        remote.set_forbidden(true);
        let err = remote.get_preferences().await.unwrap_err();
        assert!(err.is_forbidden());
    }

    #[tokio::test]
    async fn patch_merges_attributes() {
        let remote = MemoryRemote::provisioned();
        let mut first = Attributes::new();
        first.insert("a".to_string(), json!(1));
        remote.patch_preferences(first).await.unwrap();
        let mut second = Attributes::new();
        second.insert("b".to_string(), json!(2));
        remote.patch_preferences(second).await.unwrap();

        let prefs = remote.get_preferences().await.unwrap();
        assert_eq!(prefs.get("a"), Some(&json!(1)));
        assert_eq!(prefs.get("b"), Some(&json!(2)));
        assert_eq!(remote.preference_writes(), 2);
    }

    #[tokio::test]
    async fn create_rejects_existing_object() {
        let remote = MemoryRemote::provisioned();
        remote
            .create_object("Feature", "x", Attributes::new())
            .await
            .unwrap();
        let err = remote
            .create_object("Feature", "x", Attributes::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, 409);
    }

    #[tokio::test]
    async fn delete_missing_object_is_not_found() {
        let remote = MemoryRemote::provisioned();
        let err = remote.delete_object("Feature", "x").await.unwrap_err();
        assert!(err.is_not_found());
    }
}

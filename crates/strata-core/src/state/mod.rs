//! Remote state records.
//!
//! Mirrors what is persisted on the target: the migration record (schema
//! version, applied units, identity registry, variables) and the feature
//! record set.

pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::VarMap;

pub use store::{REDACTED_MARKER, StateStore, redact_secrets};

/// Schema version an identity last bootstrapped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityStamp {
    pub schema_version: u32,
}

/// Identity id → stamp.
pub type IdentityRegistry = BTreeMap<String, IdentityStamp>;

/// The version gate shared by both state kinds.
pub trait VersionGate {
    fn schema_version(&self) -> Option<u32>;
    fn identities(&self) -> &IdentityRegistry;
    fn identities_mut(&mut self) -> &mut IdentityRegistry;
    fn set_schema_version(&mut self, version: u32);
}

/// Singleton migration record of a target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteMigrationState {
    pub schema_version: Option<u32>,
    /// Application order, no duplicates.
    pub applied_units: Vec<String>,
    pub registered_identities: IdentityRegistry,
    pub variables: VarMap,
}

impl VersionGate for RemoteMigrationState {
    fn schema_version(&self) -> Option<u32> {
        self.schema_version
    }

    fn identities(&self) -> &IdentityRegistry {
        &self.registered_identities
    }

    fn identities_mut(&mut self) -> &mut IdentityRegistry {
        &mut self.registered_identities
    }

    fn set_schema_version(&mut self, version: u32) {
        self.schema_version = Some(version);
    }
}

/// Singleton feature record set of a target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureRemoteState {
    pub features_schema_version: Option<u32>,
    pub registered_identities: IdentityRegistry,
    pub instances: BTreeMap<String, FeatureInstance>,
}

impl FeatureRemoteState {
    pub fn instance(&self, name: &str) -> Option<&FeatureInstance> {
        self.instances.get(name)
    }
}

impl VersionGate for FeatureRemoteState {
    fn schema_version(&self) -> Option<u32> {
        self.features_schema_version
    }

    fn identities(&self) -> &IdentityRegistry {
        &self.registered_identities
    }

    fn identities_mut(&mut self) -> &mut IdentityRegistry {
        &mut self.registered_identities
    }

    fn set_schema_version(&mut self, version: u32) {
        self.features_schema_version = Some(version);
    }
}

/// One deployed feature on a target.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureInstance {
    pub name: String,
    /// Non-secret variables; secret names hold [`REDACTED_MARKER`] or are absent.
    pub variables: VarMap,
    /// Only present when the remote exposes the secret-bearing field.
    pub secret_variables: Option<VarMap>,
    /// Feature-scoped applied units.
    pub applied_units: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl FeatureInstance {
    /// Variables usable as a merge base: redaction markers dropped, readable
    /// secrets layered back in.
    pub fn stored_variables(&self) -> VarMap {
        let mut vars: VarMap = self
            .variables
            .iter()
            .filter(|(_, value)| value.as_str() != Some(REDACTED_MARKER))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(secrets) = &self.secret_variables {
            crate::types::overlay(&mut vars, secrets);
        }
        vars
    }
}

/// Union of two applied sets: `remote` order first, then unseen `local` ids.
pub fn merge_applied(remote: &[String], local: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(remote.len() + local.len());
    for unit in remote.iter().chain(local) {
        if !merged.contains(unit) {
            merged.push(unit.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_applied_keeps_concurrent_additions() {
        let remote = ids(&["A", "B", "C"]);
        let local = ids(&["A", "B", "D"]);
        assert_eq!(merge_applied(&remote, &local), ids(&["A", "B", "C", "D"]));
    }

    #[test]
    fn merge_applied_dedups_within_inputs() {
        let remote = ids(&["A", "A"]);
        let local = ids(&["B", "A", "B"]);
        assert_eq!(merge_applied(&remote, &local), ids(&["A", "B"]));
    }

    #[test]
    fn stored_variables_drop_markers() {
        let instance = FeatureInstance {
            name: "f".to_string(),
            variables: json!({"token": REDACTED_MARKER, "x": 1})
                .as_object()
                .unwrap()
                .clone(),
            secret_variables: None,
            applied_units: Vec::new(),
            created_at: None,
            last_modified_at: None,
        };
        let vars = instance.stored_variables();
        assert_eq!(serde_json::Value::Object(vars), json!({"x": 1}));
    }

    #[test]
    fn stored_variables_restore_readable_secrets() {
        let instance = FeatureInstance {
            name: "f".to_string(),
            variables: json!({"token": REDACTED_MARKER}).as_object().unwrap().clone(),
            secret_variables: Some(json!({"token": "abc"}).as_object().unwrap().clone()),
            applied_units: Vec::new(),
            created_at: None,
            last_modified_at: None,
        };
        assert_eq!(instance.stored_variables().get("token"), Some(&json!("abc")));
    }
}

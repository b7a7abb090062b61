//! State store adapter over the remote preferences record and the feature
//! object collection.
//!
//! Attribute values are written as JSON-encoded text so that map and list
//! valued state survives stores that only hold strings. Reads accept both
//! encoded text and native JSON values.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{
    FeatureInstance, FeatureRemoteState, IdentityRegistry, RemoteMigrationState, VersionGate,
};
use crate::error::{Error, Result};
use crate::remote::{Attributes, RemoteApi, RemoteObject};
use crate::types::VarMap;

/// Replaces secret values in the plain variables field.
pub const REDACTED_MARKER: &str = "<redacted>";

/// Custom object type holding one record per deployed feature.
pub const FEATURE_OBJECT_TYPE: &str = "StrataFeature";

pub(crate) const ATTR_SCHEMA_VERSION: &str = "strataSchemaVersion";
pub(crate) const ATTR_APPLIED_UNITS: &str = "strataAppliedUnits";
pub(crate) const ATTR_IDENTITIES: &str = "strataIdentities";
pub(crate) const ATTR_VARIABLES: &str = "strataVariables";
pub(crate) const ATTR_FEATURES_SCHEMA_VERSION: &str = "strataFeaturesSchemaVersion";
pub(crate) const ATTR_FEATURE_IDENTITIES: &str = "strataFeatureIdentities";

pub(crate) const OBJ_VARIABLES: &str = "variables";
pub(crate) const OBJ_SECRET_VARIABLES: &str = "secretVariables";
pub(crate) const OBJ_APPLIED_UNITS: &str = "appliedUnits";

/// Typed access to the persisted state of one target.
#[derive(Clone)]
pub struct StateStore {
    remote: Arc<dyn RemoteApi>,
}

impl StateStore {
    pub fn new(remote: Arc<dyn RemoteApi>) -> Self {
        Self { remote }
    }

    /// Read the migration record; `None` when the store is not provisioned or
    /// not visible to this identity.
    pub async fn read(&self) -> Result<Option<RemoteMigrationState>> {
        let prefs = match self.remote.get_preferences().await {
            Ok(prefs) => prefs,
            Err(err) if err.is_absent() => {
                debug!(status = err.status, "migration state not visible");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Some(RemoteMigrationState {
            schema_version: decode_version(&prefs, ATTR_SCHEMA_VERSION)?,
            applied_units: decode_attr(&prefs, ATTR_APPLIED_UNITS)?.unwrap_or_default(),
            registered_identities: decode_attr(&prefs, ATTR_IDENTITIES)?.unwrap_or_default(),
            variables: decode_attr(&prefs, ATTR_VARIABLES)?.unwrap_or_default(),
        }))
    }

    /// Full replace of the applied-units field.
    pub async fn write_applied_units(&self, units: &[String]) -> Result<()> {
        let mut attrs = Attributes::new();
        attrs.insert(ATTR_APPLIED_UNITS.to_string(), encode_attr(&units)?);
        self.remote.patch_preferences(attrs).await?;
        Ok(())
    }

    /// Combined bootstrap write: schema version, identity registry, variables.
    pub async fn write_stamp(&self, state: &RemoteMigrationState) -> Result<()> {
        let mut attrs = Attributes::new();
        if let Some(version) = state.schema_version {
            attrs.insert(ATTR_SCHEMA_VERSION.to_string(), Value::from(version));
        }
        attrs.insert(
            ATTR_IDENTITIES.to_string(),
            encode_attr(&state.registered_identities)?,
        );
        attrs.insert(ATTR_VARIABLES.to_string(), encode_attr(&state.variables)?);
        self.remote.patch_preferences(attrs).await?;
        Ok(())
    }

    /// Read the feature record set; `None` when not provisioned or not visible.
    pub async fn read_feature_state(&self) -> Result<Option<FeatureRemoteState>> {
        let prefs = match self.remote.get_preferences().await {
            Ok(prefs) => prefs,
            Err(err) if err.is_absent() => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let objects = match self.remote.search_objects(FEATURE_OBJECT_TYPE).await {
            Ok(objects) => objects,
            Err(err) if err.is_absent() => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut state = FeatureRemoteState {
            features_schema_version: decode_version(&prefs, ATTR_FEATURES_SCHEMA_VERSION)?,
            registered_identities: decode_attr::<IdentityRegistry>(
                &prefs,
                ATTR_FEATURE_IDENTITIES,
            )?
            .unwrap_or_default(),
            instances: Default::default(),
        };
        for object in objects {
            let instance = decode_instance(object)?;
            state.instances.insert(instance.name.clone(), instance);
        }
        Ok(Some(state))
    }

    /// Combined feature bootstrap write: schema version and identity registry.
    pub async fn write_feature_stamp(&self, state: &FeatureRemoteState) -> Result<()> {
        let mut attrs = Attributes::new();
        if let Some(version) = state.schema_version() {
            attrs.insert(ATTR_FEATURES_SCHEMA_VERSION.to_string(), Value::from(version));
        }
        attrs.insert(
            ATTR_FEATURE_IDENTITIES.to_string(),
            encode_attr(state.identities())?,
        );
        self.remote.patch_preferences(attrs).await?;
        Ok(())
    }

    /// Create or update a feature instance, applying the secret transform.
    ///
    /// `applied_units`, when given, replaces the instance's applied-units
    /// field in the same write.
    pub async fn write_feature_instance(
        &self,
        name: &str,
        variables: &VarMap,
        secret_names: &BTreeSet<String>,
        persist_secrets: bool,
        applied_units: Option<&[String]>,
    ) -> Result<()> {
        let (plain, secrets) = redact_secrets(variables, secret_names, persist_secrets);

        let mut attrs = Attributes::new();
        attrs.insert(OBJ_VARIABLES.to_string(), encode_attr(&plain)?);
        if let Some(secrets) = secrets {
            attrs.insert(OBJ_SECRET_VARIABLES.to_string(), encode_attr(&secrets)?);
        }
        if let Some(units) = applied_units {
            attrs.insert(OBJ_APPLIED_UNITS.to_string(), encode_attr(units)?);
        }
        self.upsert_object(name, attrs).await
    }

    /// Replace an existing instance's applied-units field.
    ///
    /// Never creates the instance: returns `false` when it does not exist yet.
    pub async fn patch_feature_applied_units(&self, name: &str, units: &[String]) -> Result<bool> {
        let mut attrs = Attributes::new();
        attrs.insert(OBJ_APPLIED_UNITS.to_string(), encode_attr(units)?);
        match self
            .remote
            .patch_object(FEATURE_OBJECT_TYPE, name, attrs)
            .await
        {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Read one feature's applied-units field; empty when the record is absent.
    pub async fn read_feature_applied_units(&self, name: &str) -> Result<Vec<String>> {
        match self.remote.get_object(FEATURE_OBJECT_TYPE, name).await {
            Ok(object) => Ok(decode_attr(&object.attributes, OBJ_APPLIED_UNITS)?.unwrap_or_default()),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_feature_instance(&self, name: &str) -> Result<()> {
        self.remote
            .delete_object(FEATURE_OBJECT_TYPE, name)
            .await
            .map_err(Error::from)
    }

    /// The store distinguishes create from patch, so probe first.
    async fn upsert_object(&self, name: &str, attrs: Attributes) -> Result<()> {
        match self.remote.get_object(FEATURE_OBJECT_TYPE, name).await {
            Ok(_) => {
                self.remote
                    .patch_object(FEATURE_OBJECT_TYPE, name, attrs)
                    .await?
            }
            Err(err) if err.is_not_found() => {
                self.remote
                    .create_object(FEATURE_OBJECT_TYPE, name, attrs)
                    .await?
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

/// Split `variables` into the plain field and the optional secret field.
///
/// With `persist_secrets`, secret values move into the secret field and the
/// plain field keeps [`REDACTED_MARKER`]. Without it, secret keys are dropped.
pub fn redact_secrets(
    variables: &VarMap,
    secret_names: &BTreeSet<String>,
    persist_secrets: bool,
) -> (VarMap, Option<VarMap>) {
    let mut plain = variables.clone();
    let mut secrets = VarMap::new();

    for name in secret_names {
        let Some(value) = plain.remove(name) else {
            continue;
        };
        if persist_secrets {
            secrets.insert(name.clone(), value);
            plain.insert(name.clone(), Value::String(REDACTED_MARKER.to_string()));
        }
    }

    let secrets = (persist_secrets && !secrets.is_empty()).then_some(secrets);
    (plain, secrets)
}

fn decode_instance(object: RemoteObject) -> Result<FeatureInstance> {
    Ok(FeatureInstance {
        variables: decode_attr(&object.attributes, OBJ_VARIABLES)?.unwrap_or_default(),
        secret_variables: decode_attr(&object.attributes, OBJ_SECRET_VARIABLES)?,
        applied_units: decode_attr(&object.attributes, OBJ_APPLIED_UNITS)?.unwrap_or_default(),
        name: object.key,
        created_at: object.created_at,
        last_modified_at: object.last_modified_at,
    })
}

fn encode_attr<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_string(value)
        .map(Value::String)
        .map_err(|e| Error::decode("state attribute", e))
}

fn decode_attr<T: DeserializeOwned>(attrs: &Attributes, key: &str) -> Result<Option<T>> {
    let parsed = match attrs.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => return Ok(None),
        Some(Value::String(text)) => serde_json::from_str(text),
        Some(other) => serde_json::from_value(other.clone()),
    };
    parsed
        .map(Some)
        .map_err(|e| Error::decode(format!("attribute '{key}'"), e))
}

fn decode_version(attrs: &Attributes, key: &str) -> Result<Option<u32>> {
    match attrs.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| Error::decode(format!("attribute '{key}'"), n)),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::decode(format!("attribute '{key}'"), e)),
        Some(other) => Err(Error::decode(format!("attribute '{key}'"), other)),
    }
}

//! State-store provisioning and per-identity version gating.
//!
//! Bootstrap imports a fixed archive that declares the state attributes on
//! the target, then stamps the calling identity at the engine's schema
//! version. Re-running it re-imports the same documents and re-stamps the
//! same version; applied units and feature instances are never touched.

use tracing::info;

use crate::archive;
use crate::context::TargetContext;
use crate::error::{Error, Result};
use crate::hooks::LifecycleHooks;
use crate::script::ScriptContext;
use crate::state::store::{
    ATTR_APPLIED_UNITS, ATTR_FEATURE_IDENTITIES, ATTR_FEATURES_SCHEMA_VERSION, ATTR_IDENTITIES,
    ATTR_SCHEMA_VERSION, ATTR_VARIABLES, FEATURE_OBJECT_TYPE, OBJ_APPLIED_UNITS,
    OBJ_SECRET_VARIABLES, OBJ_VARIABLES,
};
use crate::state::{FeatureRemoteState, IdentityStamp, RemoteMigrationState, VersionGate};

/// Migration record schema this engine reads and writes.
pub const MIGRATIONS_SCHEMA_VERSION: u32 = 2;

/// Feature record schema this engine reads and writes.
pub const FEATURES_SCHEMA_VERSION: u32 = 1;

pub(crate) const MIGRATIONS_SCOPE: &str = "migrations";
pub(crate) const FEATURES_SCOPE: &str = "features";

const MIGRATIONS_ARCHIVE: &str = "strata_bootstrap";
const FEATURES_ARCHIVE: &str = "strata_features_bootstrap";

/// Whether `identity` must bootstrap before reconciling against `state`.
pub fn is_bootstrap_required<G: VersionGate>(
    identity: &str,
    state: Option<&G>,
    expected: u32,
) -> bool {
    let Some(state) = state else {
        return true;
    };
    match state.schema_version() {
        None => return true,
        Some(version) if version < expected => return true,
        Some(_) => {}
    }
    match state.identities().get(identity) {
        None => true,
        Some(stamp) => stamp.schema_version < expected,
    }
}

/// Fail when the remote schema is newer than `expected`.
pub fn check_version_skew<G: VersionGate>(
    scope: &'static str,
    state: Option<&G>,
    expected: u32,
) -> Result<()> {
    match state.and_then(|s| s.schema_version()) {
        Some(remote) if remote > expected => Err(Error::VersionSkew {
            scope,
            remote,
            expected,
        }),
        _ => Ok(()),
    }
}

fn stamp<G: VersionGate>(state: &mut G, identity: &str, version: u32) {
    state.set_schema_version(version);
    state.identities_mut().insert(
        identity.to_string(),
        IdentityStamp {
            schema_version: version,
        },
    );
}

/// Provision the migration record and stamp the current identity.
///
/// `on_bootstrap` receives the freshly read state and may change its
/// variables before the single combined write.
pub async fn bootstrap_migrations(
    ctx: &TargetContext,
    hooks: &dyn LifecycleHooks,
    script: &ScriptContext<'_>,
) -> Result<RemoteMigrationState> {
    info!(identity = ctx.identity(), "bootstrapping migration state");
    import_documents(ctx, MIGRATIONS_ARCHIVE, migration_documents()).await?;

    let store = ctx.state_store();
    let mut state = store.read().await?.unwrap_or_default();
    stamp(&mut state, ctx.identity(), MIGRATIONS_SCHEMA_VERSION);

    hooks
        .on_bootstrap(script, &mut state)
        .await
        .map_err(|source| Error::Hook {
            hook: "on_bootstrap",
            source,
        })?;

    store
        .write_stamp(&state)
        .await
        .map_err(|e| permission_error(ctx, e))?;
    Ok(state)
}

/// Provision the feature record set and stamp the current identity.
pub async fn bootstrap_features(ctx: &TargetContext) -> Result<FeatureRemoteState> {
    info!(identity = ctx.identity(), "bootstrapping feature state");
    import_documents(ctx, FEATURES_ARCHIVE, feature_documents()).await?;

    let store = ctx.state_store();
    let mut state = store.read_feature_state().await?.unwrap_or_default();
    stamp(&mut state, ctx.identity(), FEATURES_SCHEMA_VERSION);

    store
        .write_feature_stamp(&state)
        .await
        .map_err(|e| permission_error(ctx, e))?;
    Ok(state)
}

async fn import_documents(
    ctx: &TargetContext,
    name: &str,
    documents: Vec<(&'static str, String)>,
) -> Result<()> {
    let data = archive::from_documents(name, &documents)?;
    ctx.remote()
        .import_archive(name, data)
        .await
        .map_err(|e| permission_error(ctx, e.into()))
}

/// Rewrite a raw 403 into guidance an operator can act on.
fn permission_error(ctx: &TargetContext, err: Error) -> Error {
    match err {
        Error::RemoteAccess { status: 403, message } => Error::Permission(format!(
            "identity '{}' is not permitted to provision state on {} ({}). \
             It needs at least: archive import (read/write), global preferences (read/write), \
             and read/write on the '{}' object type",
            ctx.identity(),
            ctx.remote().info().server,
            message,
            FEATURE_OBJECT_TYPE,
        )),
        other => other,
    }
}

fn preferences_document(attributes: &[(&str, u32)]) -> String {
    let body: String = attributes
        .iter()
        .map(|(id, v)| format!("            <preference preference-id=\"{id}\">{v}</preference>\n"))
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <preferences xmlns=\"http://www.demandware.com/xml/impex/preferences/2007-03-31\">\n\
         \x20   <custom-preferences>\n\
         \x20       <all-instances>\n\
         {body}\
         \x20       </all-instances>\n\
         \x20   </custom-preferences>\n\
         </preferences>\n"
    )
}

fn attribute_definition(id: &str, kind: &str) -> String {
    format!(
        "            <attribute-definition attribute-id=\"{id}\">\n\
         \x20               <display-name xml:lang=\"x-default\">{id}</display-name>\n\
         \x20               <type>{kind}</type>\n\
         \x20               <mandatory-flag>false</mandatory-flag>\n\
         \x20               <externally-managed-flag>false</externally-managed-flag>\n\
         \x20           </attribute-definition>\n"
    )
}

fn metadata_document(preference_attributes: &[(&str, &str)], custom_type: Option<&str>) -> String {
    let definitions: String = preference_attributes
        .iter()
        .map(|(id, kind)| attribute_definition(id, kind))
        .collect();
    let custom = custom_type.unwrap_or_default();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <metadata xmlns=\"http://www.demandware.com/xml/impex/metadata/2006-10-31\">\n\
         \x20   <type-extension type-id=\"SitePreferences\">\n\
         \x20       <custom-attribute-definitions>\n\
         {definitions}\
         \x20       </custom-attribute-definitions>\n\
         \x20   </type-extension>\n\
         {custom}\
         </metadata>\n"
    )
}

fn feature_object_type() -> String {
    let definitions: String = [
        (OBJ_VARIABLES, "text"),
        (OBJ_SECRET_VARIABLES, "password"),
        (OBJ_APPLIED_UNITS, "text"),
    ]
    .iter()
    .map(|(id, kind)| attribute_definition(id, kind))
    .collect();
    format!(
        "    <custom-type type-id=\"{FEATURE_OBJECT_TYPE}\">\n\
         \x20       <staging-mode>no-staging</staging-mode>\n\
         \x20       <storage-scope>organization</storage-scope>\n\
         \x20       <key-definition attribute-id=\"name\">\n\
         \x20           <type>string</type>\n\
         \x20           <min-length>0</min-length>\n\
         \x20       </key-definition>\n\
         \x20       <attribute-definitions>\n\
         {definitions}\
         \x20       </attribute-definitions>\n\
         \x20   </custom-type>\n"
    )
}

fn migration_documents() -> Vec<(&'static str, String)> {
    vec![
        (
            "sites/preferences.xml",
            preferences_document(&[(ATTR_SCHEMA_VERSION, 0)]),
        ),
        (
            "meta/system-objecttype-extensions.xml",
            metadata_document(
                &[
                    (ATTR_SCHEMA_VERSION, "int"),
                    (ATTR_APPLIED_UNITS, "text"),
                    (ATTR_IDENTITIES, "text"),
                    (ATTR_VARIABLES, "text"),
                ],
                None,
            ),
        ),
    ]
}

fn feature_documents() -> Vec<(&'static str, String)> {
    let custom_type = feature_object_type();
    vec![
        (
            "sites/preferences.xml",
            preferences_document(&[(ATTR_FEATURES_SCHEMA_VERSION, 0)]),
        ),
        (
            "meta/system-objecttype-extensions.xml",
            metadata_document(
                &[
                    (ATTR_FEATURES_SCHEMA_VERSION, "int"),
                    (ATTR_FEATURE_IDENTITIES, "text"),
                ],
                Some(&custom_type),
            ),
        ),
    ]
}

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use strata_core::bootstrap::{FEATURES_SCHEMA_VERSION, MIGRATIONS_SCHEMA_VERSION};
use strata_core::context::TargetContext;
use strata_core::hooks::{FailureOutcome, LifecycleHooks};
use strata_core::remote::{Attributes, MemoryRemote};
use strata_core::script::{FnScript, RegistryLoader, ScriptContext, UnitScript};
use strata_core::state::RemoteMigrationState;
use strata_core::types::VarMap;

pub const IDENTITY: &str = "ci-client";

pub fn vars(value: Value) -> VarMap {
    value.as_object().cloned().unwrap_or_default()
}

pub fn context(remote: &Arc<MemoryRemote>, loader: RegistryLoader) -> TargetContext {
    TargetContext::new(remote.clone(), IDENTITY, Arc::new(loader))
}

/// Preferences of a target already bootstrapped for [`IDENTITY`].
pub fn current_preferences(applied: &[&str]) -> Attributes {
    vars(json!({
        "strataSchemaVersion": MIGRATIONS_SCHEMA_VERSION,
        "strataIdentities": serde_json::to_string(
            &json!({ IDENTITY: { "schemaVersion": MIGRATIONS_SCHEMA_VERSION } })
        ).unwrap(),
        "strataAppliedUnits": serde_json::to_string(&applied).unwrap(),
        "strataFeaturesSchemaVersion": FEATURES_SCHEMA_VERSION,
        "strataFeatureIdentities": serde_json::to_string(
            &json!({ IDENTITY: { "schemaVersion": FEATURES_SCHEMA_VERSION } })
        ).unwrap(),
    }))
}

pub fn current_remote(applied: &[&str]) -> Arc<MemoryRemote> {
    Arc::new(MemoryRemote::with_preferences(current_preferences(applied)))
}

pub async fn remote_state(ctx: &TargetContext) -> RemoteMigrationState {
    ctx.state_store().read().await.unwrap().unwrap()
}

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, "").unwrap();
}

pub fn script<F>(f: F) -> Arc<dyn UnitScript>
where
    F: Fn(&ScriptContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnScript(f))
}

/// A unit that counts its invocations.
pub fn counting(counter: &Arc<AtomicUsize>) -> Arc<dyn UnitScript> {
    let counter = Arc::clone(counter);
    script(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

pub fn failing(message: &'static str) -> Arc<dyn UnitScript> {
    script(move |_| Err(anyhow::anyhow!(message)))
}

/// Lifecycle hooks that record every call.
#[derive(Default)]
pub struct RecordingHooks {
    pub events: Mutex<Vec<String>>,
    pub veto: Option<String>,
    pub handle_failures: bool,
    pub hint_bootstrap: bool,
    pub hint_fails: bool,
    pub bootstrap_vars: VarMap,
}

impl RecordingHooks {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

#[async_trait]
impl LifecycleHooks for RecordingHooks {
    async fn init(&self, _ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        self.record("init");
        Ok(())
    }

    async fn should_bootstrap(
        &self,
        _ctx: &ScriptContext<'_>,
        _state: Option<&RemoteMigrationState>,
    ) -> anyhow::Result<bool> {
        if self.hint_fails {
            anyhow::bail!("cannot decide");
        }
        Ok(self.hint_bootstrap)
    }

    async fn on_bootstrap(
        &self,
        _ctx: &ScriptContext<'_>,
        state: &mut RemoteMigrationState,
    ) -> anyhow::Result<()> {
        self.record("on_bootstrap");
        strata_core::types::overlay(&mut state.variables, &self.bootstrap_vars);
        Ok(())
    }

    async fn before_all(
        &self,
        _ctx: &ScriptContext<'_>,
        pending: &[String],
        will_apply: bool,
        dry_run: bool,
    ) -> anyhow::Result<()> {
        self.record(format!(
            "before_all:{}:{}:{}",
            pending.join(","),
            will_apply,
            dry_run
        ));
        Ok(())
    }

    async fn before_each(
        &self,
        _ctx: &ScriptContext<'_>,
        unit: &str,
        _will_apply: bool,
    ) -> anyhow::Result<bool> {
        self.record(format!("before_each:{unit}"));
        Ok(self.veto.as_deref() != Some(unit))
    }

    async fn after_each(
        &self,
        _ctx: &ScriptContext<'_>,
        unit: &str,
        _will_apply: bool,
    ) -> anyhow::Result<()> {
        self.record(format!("after_each:{unit}"));
        Ok(())
    }

    async fn after_all(
        &self,
        _ctx: &ScriptContext<'_>,
        ran: &[String],
        _will_apply: bool,
    ) -> anyhow::Result<()> {
        self.record(format!("after_all:{}", ran.join(",")));
        Ok(())
    }

    async fn on_failure(
        &self,
        _ctx: &ScriptContext<'_>,
        unit: &str,
        _error: &anyhow::Error,
    ) -> anyhow::Result<FailureOutcome> {
        self.record(format!("on_failure:{unit}"));
        if self.handle_failures {
            Ok(FailureOutcome::Handled)
        } else {
            Ok(FailureOutcome::Propagate)
        }
    }
}

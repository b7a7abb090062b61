//! Per-invocation target context.

use std::sync::Arc;

use chrono::Utc;

use crate::remote::RemoteApi;
use crate::script::ScriptLoader;
use crate::state::StateStore;
use crate::types::StateScope;

/// Remote path prefix for uploaded run logs.
pub const DEFAULT_LOG_ROOT: &str = "Logs/strata";

/// Everything a run needs to reach one target.
///
/// Frontends build this once per invocation and pass it down to the engine;
/// nothing in the engine holds a process-wide client.
#[derive(Clone)]
pub struct TargetContext {
    remote: Arc<dyn RemoteApi>,
    identity: String,
    loader: Arc<dyn ScriptLoader>,
    log_root: String,
}

impl TargetContext {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        identity: impl Into<String>,
        loader: Arc<dyn ScriptLoader>,
    ) -> Self {
        Self {
            remote,
            identity: identity.into(),
            loader,
            log_root: DEFAULT_LOG_ROOT.to_string(),
        }
    }

    pub fn with_log_root(mut self, log_root: impl Into<String>) -> Self {
        self.log_root = log_root.into();
        self
    }

    pub fn remote(&self) -> &dyn RemoteApi {
        self.remote.as_ref()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn loader(&self) -> &dyn ScriptLoader {
        self.loader.as_ref()
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(Arc::clone(&self.remote))
    }

    /// Remote path for a run log of `scope` started now.
    pub fn log_path(&self, scope: &StateScope) -> String {
        self.log_path_for(&scope.label())
    }

    /// Remote path for a run log named `label` started now.
    pub fn log_path_for(&self, label: &str) -> String {
        format!(
            "{}/{}-{}.log",
            self.log_root.trim_end_matches('/'),
            label,
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        )
    }
}

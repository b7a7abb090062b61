//! In-process script bindings.
//!
//! Embedders that compile their units into the host binary register them by
//! script path. A script file on disk that has no binding does not yield a
//! callable and is rejected as an invalid unit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{ScriptContext, ScriptLoader, UnitScript, unit_name};
use crate::error::{Error, Result};
use crate::hooks::{FeatureHooks, LifecycleHooks, NoFeatureHooks, NoHooks};

/// A synchronous unit body built from a closure.
pub struct FnScript<F>(pub F);

#[async_trait]
impl<F> UnitScript for FnScript<F>
where
    F: Fn(&ScriptContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    async fn run(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}

#[derive(Default, Clone)]
pub struct RegistryLoader {
    units: HashMap<PathBuf, Arc<dyn UnitScript>>,
    hooks: HashMap<PathBuf, Arc<dyn LifecycleHooks>>,
    feature_hooks: HashMap<PathBuf, Arc<dyn FeatureHooks>>,
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, path: impl Into<PathBuf>, script: Arc<dyn UnitScript>) -> Self {
        self.units.insert(path.into(), script);
        self
    }

    pub fn with_hooks(mut self, path: impl Into<PathBuf>, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks.insert(path.into(), hooks);
        self
    }

    pub fn with_feature_hooks(
        mut self,
        path: impl Into<PathBuf>,
        hooks: Arc<dyn FeatureHooks>,
    ) -> Self {
        self.feature_hooks.insert(path.into(), hooks);
        self
    }
}

#[async_trait]
impl ScriptLoader for RegistryLoader {
    async fn load_unit(&self, path: &Path) -> Result<Arc<dyn UnitScript>> {
        self.units
            .get(path)
            .cloned()
            .ok_or_else(|| Error::InvalidUnit {
                unit: unit_name(path),
                reason: "script does not export a callable".to_string(),
            })
    }

    async fn load_hooks(&self, path: &Path) -> Result<Arc<dyn LifecycleHooks>> {
        Ok(self
            .hooks
            .get(path)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoHooks)))
    }

    async fn load_feature_hooks(&self, path: &Path) -> Result<Arc<dyn FeatureHooks>> {
        Ok(self
            .feature_hooks
            .get(path)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoFeatureHooks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::runlog::RunLog;
    use crate::types::VarMap;

    #[tokio::test]
    async fn unbound_unit_is_invalid() {
        let loader = RegistryLoader::new();
        let err = loader
            .load_unit(Path::new("/project/migrations/0001-a.script"))
            .await
            .err()
            .unwrap();
        match err {
            Error::InvalidUnit { unit, .. } => assert_eq!(unit, "0001-a.script"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn bound_closure_runs_with_context() {
        let path = PathBuf::from("/project/migrations/0001-a.script");
        let loader = RegistryLoader::new().with_unit(
            &path,
            Arc::new(FnScript(|ctx: &ScriptContext<'_>| {
                ctx.log.info(format!("x = {}", ctx.vars["x"]));
                Ok(())
            })),
        );

        let remote = MemoryRemote::provisioned();
        let log = RunLog::new();
        let mut vars = VarMap::new();
        vars.insert("x".to_string(), serde_json::json!(7));
        let ctx = ScriptContext::new(&remote, "client", &log, &vars);

        let script = loader.load_unit(&path).await.unwrap();
        script.run(&ctx).await.unwrap();
        assert!(log.lines()[0].ends_with("x = 7"));
    }
}

//! Feature deployment: parameterized bundles installed, updated, and
//! removed as named instances on a target.

pub mod definition;
pub mod questions;

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::archive;
use crate::bootstrap::{
    self, FEATURES_SCHEMA_VERSION, FEATURES_SCOPE, check_version_skew, is_bootstrap_required,
};
use crate::catalog;
use crate::context::TargetContext;
use crate::error::{Error, Result};
use crate::hooks::{FeatureHooks, NoFeatureHooks};
use crate::reconcile::{self, ReconcileOptions, RunSummary};
use crate::runlog::RunLog;
use crate::script::ScriptContext;
use crate::state::{FeatureInstance, FeatureRemoteState, redact_secrets};
use crate::types::{StateScope, VarMap, overlay};

pub use definition::{
    FEATURE_ARTIFACTS_DIR, FEATURE_DESCRIPTOR, FEATURE_HOOKS_FILE, FEATURE_UNITS_DIR,
    FeatureDefinition,
};
pub use questions::{Prompter, Question, QuestionKind, outstanding};

/// Run-log label of `update_all`. Per-feature labels all start with
/// `feature-`, so no feature name can produce it.
pub const UPDATE_ALL_LOG_LABEL: &str = "features-update";

/// Knobs for deploying or updating features.
#[derive(Debug, Clone)]
pub struct FeatureOptions {
    /// Caller overrides; the highest precedence layer below answers.
    pub vars: VarMap,
    /// Keep secret values in the secret field instead of dropping them.
    pub persist_secrets: bool,
    pub allow_bootstrap: bool,
    pub force_bootstrap: bool,
    pub show_notes: bool,
    pub commit_interval: NonZeroUsize,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self {
            vars: VarMap::new(),
            persist_secrets: false,
            allow_bootstrap: true,
            force_bootstrap: false,
            show_notes: false,
            commit_interval: NonZeroUsize::MIN,
        }
    }
}

/// Outcome of deploying one feature.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureReport {
    pub name: String,
    /// Variables as written to the plain record.
    pub variables: VarMap,
    /// `None` when the feature has no unit sub-catalog.
    pub migrations: Option<RunSummary>,
    pub artifacts: Vec<String>,
    /// Names of questions answered interactively.
    pub answered: Vec<String>,
    pub bootstrapped: bool,
}

/// `defaults < stored < caller`.
pub fn merge_variables(defaults: &VarMap, stored: Option<&VarMap>, caller: &VarMap) -> VarMap {
    let mut merged = defaults.clone();
    if let Some(stored) = stored {
        overlay(&mut merged, stored);
    }
    overlay(&mut merged, caller);
    merged
}

/// List the features defined under `dir`.
pub fn list_features(dir: &Path) -> Result<Vec<FeatureDefinition>> {
    catalog::collect_features(dir)
}

/// List the feature instances deployed on the target.
pub async fn deployed_features(ctx: &TargetContext) -> Result<Vec<FeatureInstance>> {
    Ok(ctx
        .state_store()
        .read_feature_state()
        .await?
        .map(|state| state.instances.into_values().collect())
        .unwrap_or_default())
}

/// Deploys features from one local features directory onto one target.
pub struct FeatureDeployer<'a> {
    ctx: &'a TargetContext,
    features_dir: PathBuf,
    prompter: Option<&'a dyn Prompter>,
}

impl<'a> FeatureDeployer<'a> {
    pub fn new(ctx: &'a TargetContext, features_dir: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            features_dir: features_dir.into(),
            prompter: None,
        }
    }

    pub fn with_prompter(mut self, prompter: &'a dyn Prompter) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn definitions(&self) -> Result<Vec<FeatureDefinition>> {
        list_features(&self.features_dir)
    }

    fn find(&self, name: &str) -> Result<FeatureDefinition> {
        self.definitions()?
            .into_iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::not_found("feature", name))
    }

    /// Deploy (or redeploy) the named feature.
    pub async fn deploy(&self, name: &str, options: &FeatureOptions) -> Result<FeatureReport> {
        let definition = self.find(name)?;
        self.deploy_logged(&definition, options, None).await
    }

    /// Redeploy every feature both defined locally and deployed remotely.
    pub async fn update_all(&self, options: &FeatureOptions) -> Result<Vec<FeatureReport>> {
        let log = RunLog::new();
        let (state, _) = self.ensure_schema(options, &log).await?;
        let definitions = self.definitions()?;

        for name in state.instances.keys() {
            if !definitions.iter().any(|d| &d.name == name) {
                log.warn(format!(
                    "feature {name} is deployed on the target but not defined locally; skipping"
                ));
            }
        }

        let mut reports = Vec::new();
        for definition in &definitions {
            if state.instance(&definition.name).is_none() {
                continue;
            }
            reports.push(
                self.deploy_logged(definition, options, Some(state.clone()))
                    .await?,
            );
        }
        let path = self.ctx.log_path_for(UPDATE_ALL_LOG_LABEL);
        log.persist(self.ctx.remote(), &path).await;
        Ok(reports)
    }

    /// Run the feature's `remove` hook, then delete its remote record.
    pub async fn remove(&self, name: &str, vars: &VarMap) -> Result<()> {
        let definition = self.find(name)?;
        let store = self.ctx.state_store();
        let state = store.read_feature_state().await?.unwrap_or_default();
        let instance = state
            .instance(name)
            .ok_or_else(|| Error::not_found("deployed feature", name))?;

        let stored = instance.stored_variables();
        let merged = merge_variables(&definition.default_variables, Some(&stored), vars);

        let log = RunLog::new();
        let hooks = self.load_hooks(&definition).await?;
        let sctx = ScriptContext::new(self.ctx.remote(), self.ctx.identity(), &log, &merged);
        hooks.remove(&sctx).await.map_err(|source| Error::Hook {
            hook: "remove",
            source,
        })?;

        store.delete_feature_instance(name).await?;
        log.info(format!("removed feature {name}"));
        log.persist(
            self.ctx.remote(),
            &self.ctx.log_path(&StateScope::Feature(name.to_string())),
        )
        .await;
        Ok(())
    }

    async fn deploy_logged(
        &self,
        definition: &FeatureDefinition,
        options: &FeatureOptions,
        state: Option<FeatureRemoteState>,
    ) -> Result<FeatureReport> {
        let log = RunLog::new();
        let outcome = self.deploy_definition(definition, options, state, &log).await;
        if let Err(err) = &outcome {
            log.error(format!("deploying {} failed: {err}", definition.name));
        }
        log.persist(
            self.ctx.remote(),
            &self
                .ctx
                .log_path(&StateScope::Feature(definition.name.clone())),
        )
        .await;
        outcome
    }

    async fn deploy_definition(
        &self,
        definition: &FeatureDefinition,
        options: &FeatureOptions,
        state: Option<FeatureRemoteState>,
        log: &RunLog,
    ) -> Result<FeatureReport> {
        let name = definition.name.as_str();
        info!(feature = name, "deploying feature");
        let hooks = self.load_hooks(definition).await?;

        let caller = options.vars.clone();
        let sctx = ScriptContext::new(self.ctx.remote(), self.ctx.identity(), log, &caller);
        hooks
            .before_deploy(&sctx)
            .await
            .map_err(|source| Error::Hook {
                hook: "before_deploy",
                source,
            })?;

        let (mut state, bootstrapped) = match state {
            Some(state) => (state, false),
            None => self.ensure_schema(options, log).await?,
        };

        let mut merged = self.merge_for(definition, &state, &options.vars);

        let produced = {
            let sctx = ScriptContext::new(self.ctx.remote(), self.ctx.identity(), log, &merged);
            hooks
                .questions(&sctx, &state)
                .await
                .map_err(|source| Error::Hook {
                    hook: "questions",
                    source,
                })?
        };
        let questions = match produced {
            Some(questions) => {
                state = self
                    .ctx
                    .state_store()
                    .read_feature_state()
                    .await?
                    .unwrap_or_default();
                merged = self.merge_for(definition, &state, &options.vars);
                questions
            }
            None => definition.questions.clone(),
        };

        let open = outstanding(&questions, &merged);
        let mut answered = Vec::new();
        if let Some(prompter) = self.prompter
            && !open.is_empty()
        {
            let answers = prompter.ask(&open, &merged).map_err(|source| Error::Hook {
                hook: "questions",
                source,
            })?;
            answered = answers.keys().cloned().collect();
            overlay(&mut merged, &answers);
        } else if !open.is_empty() {
            log.warn(format!(
                "{} unanswered question(s) for {name}; continuing non-interactively",
                open.len()
            ));
        }

        let deployed = state.instance(name).is_some();
        let migrations = self.reconcile_units(definition, options, &merged).await?;
        let artifacts = self.sync_artifacts(definition, log).await?;

        let sctx = ScriptContext::new(self.ctx.remote(), self.ctx.identity(), log, &merged);
        hooks.finish(&sctx).await.map_err(|source| Error::Hook {
            hook: "finish",
            source,
        })?;

        // A first deployment records its units together with the instance.
        let held_units = match (&migrations, deployed) {
            (Some(summary), false) => Some(summary.applied.as_slice()),
            _ => None,
        };
        self.ctx
            .state_store()
            .write_feature_instance(
                name,
                &merged,
                &definition.secret_variable_names,
                options.persist_secrets,
                held_units,
            )
            .await?;
        log.info(format!("deployed feature {name}"));

        let (variables, _) = redact_secrets(
            &merged,
            &definition.secret_variable_names,
            options.persist_secrets,
        );
        Ok(FeatureReport {
            name: name.to_string(),
            variables,
            migrations,
            artifacts,
            answered,
            bootstrapped,
        })
    }

    fn merge_for(
        &self,
        definition: &FeatureDefinition,
        state: &FeatureRemoteState,
        caller: &VarMap,
    ) -> VarMap {
        let stored = state
            .instance(&definition.name)
            .map(FeatureInstance::stored_variables);
        merge_variables(&definition.default_variables, stored.as_ref(), caller)
    }

    async fn load_hooks(&self, definition: &FeatureDefinition) -> Result<Arc<dyn FeatureHooks>> {
        match &definition.hooks_path {
            Some(path) => self.ctx.loader().load_feature_hooks(path).await,
            None => Ok(Arc::new(NoFeatureHooks)),
        }
    }

    /// Check the feature schema gate, bootstrapping when needed and allowed.
    async fn ensure_schema(
        &self,
        options: &FeatureOptions,
        log: &RunLog,
    ) -> Result<(FeatureRemoteState, bool)> {
        let state = self.ctx.state_store().read_feature_state().await?;
        check_version_skew(FEATURES_SCOPE, state.as_ref(), FEATURES_SCHEMA_VERSION)?;

        let required =
            is_bootstrap_required(self.ctx.identity(), state.as_ref(), FEATURES_SCHEMA_VERSION);
        if !required && !options.force_bootstrap {
            return Ok((state.unwrap_or_default(), false));
        }
        if !options.allow_bootstrap && !options.force_bootstrap {
            return Err(Error::BootstrapRequired {
                scope: FEATURES_SCOPE,
                identity: self.ctx.identity().to_string(),
            });
        }
        log.info(format!(
            "bootstrapping feature state for {}",
            self.ctx.identity()
        ));
        let state = bootstrap::bootstrap_features(self.ctx).await?;
        Ok((state, true))
    }

    async fn reconcile_units(
        &self,
        definition: &FeatureDefinition,
        options: &FeatureOptions,
        vars: &VarMap,
    ) -> Result<Option<RunSummary>> {
        let dir = definition.units_dir();
        if !dir.is_dir() {
            return Ok(None);
        }
        let run_options = ReconcileOptions {
            exclude: definition.excluded_unit_patterns.clone(),
            vars: vars.clone(),
            show_notes: options.show_notes,
            commit_interval: options.commit_interval,
            ..ReconcileOptions::default()
        };
        let scope = StateScope::Feature(definition.name.clone());
        reconcile::reconcile_scoped(self.ctx, &dir, &scope, &run_options)
            .await
            .map(Some)
    }

    /// Upload each code artifact directory as its own archive.
    async fn sync_artifacts(
        &self,
        definition: &FeatureDefinition,
        log: &RunLog,
    ) -> Result<Vec<String>> {
        let dir = definition.artifacts_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            if definition.excluded_artifact_names.contains(&name) {
                log.info(format!("skipping excluded code artifact {name}"));
                continue;
            }
            names.push(name);
        }
        names.sort();

        for name in &names {
            let data = archive::from_dir(name, &dir.join(name))?;
            log.info(format!("uploading code artifact {name}"));
            self.ctx.remote().upload_code(name, data).await?;
        }
        if names.is_empty() {
            debug!(feature = %definition.name, "no code artifacts to sync");
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: serde_json::Value) -> VarMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn merge_precedence_is_defaults_stored_caller() {
        let merged = merge_variables(
            &vars(json!({"x": 1})),
            Some(&vars(json!({"x": 2, "y": 3}))),
            &vars(json!({"y": 4})),
        );
        assert_eq!(serde_json::Value::Object(merged), json!({"x": 2, "y": 4}));
    }

    #[test]
    fn merge_without_stored_instance() {
        let merged = merge_variables(&vars(json!({"x": 1})), None, &VarMap::new());
        assert_eq!(serde_json::Value::Object(merged), json!({"x": 1}));
    }
}

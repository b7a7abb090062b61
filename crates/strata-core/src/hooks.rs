//! Project-supplied lifecycle callbacks.
//!
//! Every hook has a default that behaves exactly like the hook being absent,
//! so a loader only overrides what the project actually provides.

use async_trait::async_trait;

use crate::feature::Question;
use crate::script::ScriptContext;
use crate::state::{FeatureRemoteState, RemoteMigrationState};

/// Names a loader may report when checking a hook script's shape.
pub const LIFECYCLE_HOOKS: &[&str] = &[
    "init",
    "should_bootstrap",
    "on_bootstrap",
    "before_all",
    "before_each",
    "after_each",
    "after_all",
    "on_failure",
];

pub const FEATURE_HOOKS: &[&str] = &["before_deploy", "questions", "finish", "remove"];

/// What happened to a unit failure after `on_failure` ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The hook handled the error; the unit is committed and the run continues.
    Handled,
    /// No hook: the error halts the run.
    Propagate,
}

#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn init(&self, _ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// ORed into the computed bootstrap requirement.
    async fn should_bootstrap(
        &self,
        _ctx: &ScriptContext<'_>,
        _state: Option<&RemoteMigrationState>,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// May mutate `state.variables` before the stamp is written.
    async fn on_bootstrap(
        &self,
        _ctx: &ScriptContext<'_>,
        _state: &mut RemoteMigrationState,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_all(
        &self,
        _ctx: &ScriptContext<'_>,
        _pending: &[String],
        _will_apply: bool,
        _dry_run: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// `false` skips execution of this unit; it is still recorded.
    async fn before_each(
        &self,
        _ctx: &ScriptContext<'_>,
        _unit: &str,
        _will_apply: bool,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn after_each(
        &self,
        _ctx: &ScriptContext<'_>,
        _unit: &str,
        _will_apply: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_all(
        &self,
        _ctx: &ScriptContext<'_>,
        _ran: &[String],
        _will_apply: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_failure(
        &self,
        _ctx: &ScriptContext<'_>,
        _unit: &str,
        _error: &anyhow::Error,
    ) -> anyhow::Result<FailureOutcome> {
        Ok(FailureOutcome::Propagate)
    }
}

/// The empty hook bundle.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl LifecycleHooks for NoHooks {}

#[async_trait]
pub trait FeatureHooks: Send + Sync {
    async fn before_deploy(&self, _ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// `None` means the descriptor's static question list applies.
    async fn questions(
        &self,
        _ctx: &ScriptContext<'_>,
        _state: &FeatureRemoteState,
    ) -> anyhow::Result<Option<Vec<Question>>> {
        Ok(None)
    }

    async fn finish(&self, _ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, _ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoFeatureHooks;

impl FeatureHooks for NoFeatureHooks {}

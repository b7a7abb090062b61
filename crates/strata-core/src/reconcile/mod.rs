//! Reconciliation of a local unit catalog against a target's applied set.
//!
//! A run moves through init, collection, the state check (with optional
//! bootstrap), planning, then applies pending units strictly in catalog
//! order. Each applied unit is committed by merging it into the remote
//! applied set, so a killed run resumes where it stopped.

mod ledger;

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bootstrap::{
    self, MIGRATIONS_SCHEMA_VERSION, MIGRATIONS_SCOPE, check_version_skew,
    is_bootstrap_required,
};
use crate::catalog::{self, ChangeUnit, ExclusionSet};
use crate::context::TargetContext;
use crate::error::{Error, Result};
use crate::hooks::{FailureOutcome, LifecycleHooks, NoHooks};
use crate::runlog::RunLog;
use crate::script::ScriptContext;
use crate::types::{StateScope, UnitKind, VarMap, overlay};

use ledger::Ledger;

/// Caller-controlled knobs for one reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Regular expressions matched against catalog entry names.
    pub exclude: Vec<String>,
    /// Record applied units remotely. Without it units still run.
    pub apply: bool,
    /// Plan only: nothing is executed or recorded.
    pub dry_run: bool,
    pub force_bootstrap: bool,
    pub allow_bootstrap: bool,
    pub vars: VarMap,
    pub show_notes: bool,
    /// Units between remote commits.
    pub commit_interval: NonZeroUsize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            apply: true,
            dry_run: false,
            force_bootstrap: false,
            allow_bootstrap: true,
            vars: VarMap::new(),
            show_notes: false,
            commit_interval: NonZeroUsize::MIN,
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Catalog units not yet applied when the run started, in order.
    pub pending: Vec<String>,
    /// Units whose body ran successfully.
    pub executed: Vec<String>,
    /// Units skipped by `before_each` but still recorded.
    pub vetoed: Vec<String>,
    /// Units that failed and were handled by `on_failure`.
    pub recovered: Vec<String>,
    /// Units newly written to the remote applied set.
    pub committed: Vec<String>,
    /// The applied set as last merged: prior units plus `committed`.
    pub applied: Vec<String>,
    pub dry_run: bool,
    pub bootstrapped: bool,
}

/// Reconcile the project catalog in `dir` against the target.
pub async fn reconcile(
    ctx: &TargetContext,
    dir: &Path,
    options: &ReconcileOptions,
) -> Result<RunSummary> {
    reconcile_scoped(ctx, dir, &StateScope::Project, options).await
}

/// Reconcile `dir` recording into `scope`.
///
/// Feature scopes skip the migration bootstrap gate; the feature engine
/// checks its own gate before it gets here.
pub(crate) async fn reconcile_scoped(
    ctx: &TargetContext,
    dir: &Path,
    scope: &StateScope,
    options: &ReconcileOptions,
) -> Result<RunSummary> {
    let log = RunLog::new();
    let outcome = run(ctx, dir, scope, options, &log).await;
    if let Err(err) = &outcome {
        log.error(format!("run failed: {err}"));
    }
    log.persist(ctx.remote(), &ctx.log_path(scope)).await;
    outcome
}

async fn run(
    ctx: &TargetContext,
    dir: &Path,
    scope: &StateScope,
    options: &ReconcileOptions,
    log: &RunLog,
) -> Result<RunSummary> {
    // Init
    let hooks = load_hooks(ctx, dir).await?;
    let init_vars = options.vars.clone();
    let init_ctx = ScriptContext::new(ctx.remote(), ctx.identity(), log, &init_vars);
    hooks
        .init(&init_ctx)
        .await
        .map_err(|source| Error::Hook {
            hook: "init",
            source,
        })?;

    // Collecting
    let exclusions = ExclusionSet::new(&options.exclude)?;
    let catalog = catalog::collect_units(dir, &exclusions)?;

    // StateCheck
    let mut summary = RunSummary {
        dry_run: options.dry_run,
        ..RunSummary::default()
    };
    let mut vars = VarMap::new();
    if *scope == StateScope::Project {
        let state = state_check(ctx, hooks.as_ref(), &init_ctx, options, log).await?;
        summary.bootstrapped = state.bootstrapped;
        vars = state.variables;
    }
    overlay(&mut vars, &options.vars);

    // Planning
    let ledger = Ledger::new(ctx.state_store(), scope);
    let applied = ledger.read().await?;
    let pending: Vec<&ChangeUnit> = catalog
        .units()
        .iter()
        .filter(|unit| !applied.contains(&unit.id))
        .collect();
    summary.pending = pending.iter().map(|u| u.id.clone()).collect();

    let will_apply = options.apply;
    let sctx = ScriptContext::new(ctx.remote(), ctx.identity(), log, &vars);
    hooks
        .before_all(&sctx, &summary.pending, will_apply, options.dry_run)
        .await
        .map_err(|source| Error::Hook {
            hook: "before_all",
            source,
        })?;

    if pending.is_empty() {
        log.info("no migrations required");
    } else {
        log.info(format!(
            "{} pending: {}",
            pending.len(),
            summary.pending.join(", ")
        ));
    }

    // Running / Committing
    let mut commits = Commits {
        ledger,
        local: applied,
        unflushed: 0,
        interval: options.commit_interval.get(),
        enabled: will_apply,
    };
    for unit in &pending {
        if options.show_notes
            && let Some(notes) = &unit.notes
        {
            log.info(format!("notes for {}:\n{}", unit.id, notes));
        }
        if options.dry_run {
            log.info(format!("[dry run] would apply {}", unit.id));
            continue;
        }

        let result = apply_unit(ctx, hooks.as_ref(), &sctx, unit, will_apply, &mut summary).await;
        if let Err(err) = result {
            if let Err(flush_err) = commits.flush().await {
                warn!(error = %flush_err, "failed to flush committed units");
            }
            return Err(err);
        }

        commits.record(&unit.id, &mut summary).await?;
        hooks
            .after_each(&sctx, &unit.id, will_apply)
            .await
            .map_err(|source| Error::Hook {
                hook: "after_each",
                source,
            })?;
    }
    commits.flush().await?;
    summary.applied = commits.local;

    // Done
    if !options.dry_run {
        let ran: Vec<String> = summary
            .pending
            .iter()
            .filter(|id| summary.executed.contains(id) || summary.recovered.contains(id))
            .cloned()
            .collect();
        hooks
            .after_all(&sctx, &ran, will_apply)
            .await
            .map_err(|source| Error::Hook {
                hook: "after_all",
                source,
            })?;
    }

    info!(
        scope = %scope.label(),
        executed = summary.executed.len(),
        committed = summary.committed.len(),
        "reconciliation finished"
    );
    Ok(summary)
}

async fn load_hooks(ctx: &TargetContext, dir: &Path) -> Result<Arc<dyn LifecycleHooks>> {
    match catalog::hooks_path(dir) {
        Some(path) => {
            debug!(path = %path.display(), "loading lifecycle hooks");
            ctx.loader().load_hooks(&path).await
        }
        None => Ok(Arc::new(NoHooks)),
    }
}

struct CheckedState {
    variables: VarMap,
    bootstrapped: bool,
}

async fn state_check(
    ctx: &TargetContext,
    hooks: &dyn LifecycleHooks,
    sctx: &ScriptContext<'_>,
    options: &ReconcileOptions,
    log: &RunLog,
) -> Result<CheckedState> {
    let store = ctx.state_store();
    let state = store.read().await?;
    check_version_skew(MIGRATIONS_SCOPE, state.as_ref(), MIGRATIONS_SCHEMA_VERSION)?;

    let computed = is_bootstrap_required(ctx.identity(), state.as_ref(), MIGRATIONS_SCHEMA_VERSION);
    let hinted = match hooks.should_bootstrap(sctx, state.as_ref()).await {
        Ok(hinted) => hinted,
        Err(err) => {
            log.warn(format!("should_bootstrap failed, bootstrapping: {err:#}"));
            true
        }
    };

    if !(computed || hinted || options.force_bootstrap) {
        return Ok(CheckedState {
            variables: state.map(|s| s.variables).unwrap_or_default(),
            bootstrapped: false,
        });
    }
    if !options.allow_bootstrap && !options.force_bootstrap {
        return Err(Error::BootstrapRequired {
            scope: MIGRATIONS_SCOPE,
            identity: ctx.identity().to_string(),
        });
    }

    log.info(format!("bootstrapping migration state for {}", ctx.identity()));
    let state = bootstrap::bootstrap_migrations(ctx, hooks, sctx).await?;
    Ok(CheckedState {
        variables: state.variables,
        bootstrapped: true,
    })
}

async fn apply_unit(
    ctx: &TargetContext,
    hooks: &dyn LifecycleHooks,
    sctx: &ScriptContext<'_>,
    unit: &ChangeUnit,
    will_apply: bool,
    summary: &mut RunSummary,
) -> Result<()> {
    let proceed = hooks
        .before_each(sctx, &unit.id, will_apply)
        .await
        .map_err(|source| Error::Hook {
            hook: "before_each",
            source,
        })?;
    if !proceed {
        sctx.log.info(format!("skipping {} (vetoed by before_each)", unit.id));
        summary.vetoed.push(unit.id.clone());
        return Ok(());
    }

    sctx.log.info(format!("applying {}", unit.id));
    let outcome = match unit.kind {
        UnitKind::ArchiveBundle => sctx.helpers.import_dir(&unit.path).await,
        UnitKind::ExecutableScript => {
            let script = ctx.loader().load_unit(&unit.path).await?;
            script.run(sctx).await
        }
    };
    let Err(err) = outcome else {
        summary.executed.push(unit.id.clone());
        return Ok(());
    };

    sctx.log.error(format!("{} failed: {err:#}", unit.id));
    match hooks.on_failure(sctx, &unit.id, &err).await {
        Ok(FailureOutcome::Handled) => {
            sctx.log.warn(format!("{} failure handled by on_failure", unit.id));
            summary.recovered.push(unit.id.clone());
            Ok(())
        }
        Ok(FailureOutcome::Propagate) => Err(Error::UnitExecution {
            unit: unit.id.clone(),
            source: err,
        }),
        Err(hook_err) => {
            sctx.log.error(format!("on_failure failed: {hook_err:#}"));
            Err(Error::UnitExecution {
                unit: unit.id.clone(),
                source: err,
            })
        }
    }
}

/// Local applied set plus the remote write cadence.
struct Commits<'a> {
    ledger: Ledger<'a>,
    local: Vec<String>,
    unflushed: usize,
    interval: usize,
    enabled: bool,
}

impl Commits<'_> {
    async fn record(&mut self, unit: &str, summary: &mut RunSummary) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !self.local.iter().any(|u| u == unit) {
            self.local.push(unit.to_string());
        }
        summary.committed.push(unit.to_string());
        self.unflushed += 1;
        if self.unflushed >= self.interval {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.enabled || self.unflushed == 0 {
            return Ok(());
        }
        self.local = self.ledger.commit(&self.local).await?;
        self.unflushed = 0;
        Ok(())
    }
}

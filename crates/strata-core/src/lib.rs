//! Strata Core Library
//!
//! Reconciles ordered catalogs of change-units and parameterized feature
//! bundles against a remote target that records what has been applied.

pub mod archive;
pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod feature;
pub mod hooks;
pub mod reconcile;
pub mod remote;
pub mod runlog;
pub mod script;
pub mod state;
pub mod types;

pub use error::{Error, Result};

/// Re-exports of commonly used types
pub mod prelude {
    // Engine
    pub use crate::context::TargetContext;
    pub use crate::error::{Error, Result};
    pub use crate::reconcile::{ReconcileOptions, RunSummary, reconcile};

    // Catalog
    pub use crate::catalog::{Catalog, ChangeUnit, ExclusionSet, collect_features, collect_units};

    // Features
    pub use crate::feature::{
        FeatureDefinition, FeatureDeployer, FeatureOptions, FeatureReport, Prompter, Question,
        QuestionKind, deployed_features, list_features,
    };

    // Hooks and scripts
    pub use crate::hooks::{FailureOutcome, FeatureHooks, LifecycleHooks};
    pub use crate::script::{
        CommandLoader, FnScript, RegistryLoader, ScriptContext, ScriptLoader, UnitScript,
    };

    // Remote and state
    pub use crate::remote::{HttpRemote, MemoryRemote, RemoteApi, RemoteError};
    pub use crate::state::{FeatureInstance, FeatureRemoteState, RemoteMigrationState};

    // Configuration
    pub use crate::config::{ProjectConfig, VarSources};

    pub use crate::types::{StateScope, UnitKind, VarMap};
}

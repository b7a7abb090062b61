//! Project configuration.
//!
//! Two layers, later wins: the global `strata.toml` under the user config
//! directory, then `./strata.toml` in the project. CLI flags override both.

pub mod parser;
pub mod vars;

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use parser::{parse_project_toml, parse_project_toml_str};
pub use vars::VarSources;

pub const CONFIG_FILE: &str = "strata.toml";
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";
pub const DEFAULT_FEATURES_DIR: &str = "features";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub target: TargetConfig,
    pub paths: PathsConfig,
    pub migrate: MigrateConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    pub server: Option<String>,
    /// Client id the engine registers under.
    pub identity: Option<String>,
    pub code_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub migrations: Option<PathBuf>,
    pub features: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrateConfig {
    pub exclude: Vec<String>,
    pub show_notes: Option<bool>,
    pub commit_interval: Option<NonZeroUsize>,
}

impl ProjectConfig {
    pub fn migrations_dir(&self) -> PathBuf {
        self.paths
            .migrations
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MIGRATIONS_DIR))
    }

    pub fn features_dir(&self) -> PathBuf {
        self.paths
            .features
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FEATURES_DIR))
    }

    pub fn commit_interval(&self) -> NonZeroUsize {
        self.migrate.commit_interval.unwrap_or(NonZeroUsize::MIN)
    }

    /// Overlay `layer` onto `self`; set fields in `layer` win.
    pub fn merge(&mut self, layer: ProjectConfig) {
        let ProjectConfig {
            target,
            paths,
            migrate,
        } = layer;

        if target.server.is_some() {
            self.target.server = target.server;
        }
        if target.identity.is_some() {
            self.target.identity = target.identity;
        }
        if target.code_version.is_some() {
            self.target.code_version = target.code_version;
        }

        if paths.migrations.is_some() {
            self.paths.migrations = paths.migrations;
        }
        if paths.features.is_some() {
            self.paths.features = paths.features;
        }

        // Exclusions accumulate across layers
        for pattern in migrate.exclude {
            if !self.migrate.exclude.contains(&pattern) {
                self.migrate.exclude.push(pattern);
            }
        }
        if migrate.show_notes.is_some() {
            self.migrate.show_notes = migrate.show_notes;
        }
        if migrate.commit_interval.is_some() {
            self.migrate.commit_interval = migrate.commit_interval;
        }
    }
}

/// Location of the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("strata").join(CONFIG_FILE))
}

/// Load the global and project layers for `project_dir`.
pub fn load_config(project_dir: &Path) -> anyhow::Result<ProjectConfig> {
    let global = global_config_path();
    load_layers(global.as_deref(), &project_dir.join(CONFIG_FILE))
}

/// Load and merge explicit layer files; missing files are skipped.
pub fn load_layers(global: Option<&Path>, project: &Path) -> anyhow::Result<ProjectConfig> {
    let mut config = ProjectConfig::default();
    for path in global.into_iter().chain(std::iter::once(project)) {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            config.merge(parse_project_toml(path)?);
        }
    }
    Ok(config)
}

//! Feature bundle descriptors.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::questions::Question;
use crate::config::parser::describe_toml_error;
use crate::error::{Error, Result};
use crate::types::VarMap;

pub const FEATURE_DESCRIPTOR: &str = "feature.toml";
pub const FEATURE_HOOKS_FILE: &str = "feature.script";
pub const FEATURE_UNITS_DIR: &str = "migrations";
pub const FEATURE_ARTIFACTS_DIR: &str = "cartridges";

/// On-disk shape of `feature.toml`.
///
/// ```toml
/// name = "search"
/// requires = ["base"]
/// secret_variables = ["apiToken"]
/// exclude_cartridges = ["int_search_tests"]
///
/// [variables]
/// pageSize = 24
///
/// [[question]]
/// name = "apiToken"
/// message = "Search API token"
/// type = "password"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FeatureDescriptor {
    name: Option<String>,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    variables: VarMap,
    #[serde(default)]
    secret_variables: Vec<String>,
    #[serde(default)]
    exclude_migrations: Vec<String>,
    #[serde(default)]
    exclude_cartridges: Vec<String>,
    #[serde(default, rename = "question")]
    questions: Vec<Question>,
}

/// A locally defined, deployable feature bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDefinition {
    pub name: String,
    /// The feature directory.
    pub path: PathBuf,
    /// Advisory only.
    pub requires: Vec<String>,
    pub default_variables: VarMap,
    pub secret_variable_names: BTreeSet<String>,
    pub excluded_unit_patterns: Vec<String>,
    pub excluded_artifact_names: BTreeSet<String>,
    /// Static questions, used when the hooks do not produce their own.
    pub questions: Vec<Question>,
    pub hooks_path: Option<PathBuf>,
}

impl FeatureDefinition {
    /// Load the feature in `dir`; `None` when it carries no descriptor.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let descriptor_path = dir.join(FEATURE_DESCRIPTOR);
        if !descriptor_path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&descriptor_path)
            .map_err(|e| Error::io(&descriptor_path, e))?;
        let descriptor: FeatureDescriptor = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "{}: {}",
                descriptor_path.display(),
                describe_toml_error(&e, &content)
            ))
        })?;

        let name = match descriptor.name {
            Some(name) => name,
            None => dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    Error::Config(format!("cannot name feature at {}", dir.display()))
                })?,
        };
        let hooks_path = dir.join(FEATURE_HOOKS_FILE);

        Ok(Some(Self {
            name,
            path: dir.to_path_buf(),
            requires: descriptor.requires,
            default_variables: descriptor.variables,
            secret_variable_names: descriptor.secret_variables.into_iter().collect(),
            excluded_unit_patterns: descriptor.exclude_migrations,
            excluded_artifact_names: descriptor.exclude_cartridges.into_iter().collect(),
            questions: descriptor.questions,
            hooks_path: hooks_path.is_file().then_some(hooks_path),
        }))
    }

    pub fn units_dir(&self) -> PathBuf {
        self.path.join(FEATURE_UNITS_DIR)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.path.join(FEATURE_ARTIFACTS_DIR)
    }
}

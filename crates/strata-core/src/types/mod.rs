//! Shared core types used across the state, catalog, and engine layers.

use serde::{Deserialize, Serialize};

/// Free-form JSON variables shared between hooks, scripts, and features.
pub type VarMap = serde_json::Map<String, serde_json::Value>;

/// What a change-unit is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// A directory imported as an archive.
    ArchiveBundle,
    /// A `*.script` file invoked as a callable.
    ExecutableScript,
}

/// Which applied-set a reconciliation run records into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateScope {
    /// The project's global migration record.
    Project,
    /// The applied-set stored on one feature instance.
    Feature(String),
}

impl StateScope {
    pub fn label(&self) -> String {
        match self {
            Self::Project => "migrations".to_string(),
            Self::Feature(name) => format!("feature-{name}"),
        }
    }
}

/// Overlay `layer` onto `base`; keys in `layer` win.
pub fn overlay(base: &mut VarMap, layer: &VarMap) {
    for (key, value) in layer {
        base.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_replaces_and_adds() {
        let mut base = json!({"x": 1, "y": 2}).as_object().unwrap().clone();
        let layer = json!({"y": 3, "z": 4}).as_object().unwrap().clone();
        overlay(&mut base, &layer);
        assert_eq!(serde_json::Value::Object(base), json!({"x": 1, "y": 3, "z": 4}));
    }

    #[test]
    fn scope_labels_are_path_safe() {
        assert_eq!(StateScope::Project.label(), "migrations");
        assert_eq!(StateScope::Feature("search".into()).label(), "feature-search");
    }
}

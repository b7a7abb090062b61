//! Local unit and feature discovery.
//!
//! A catalog directory holds one entry per change-unit:
//! - a sub-directory is an archive bundle, imported as a whole
//! - a `*.script` file is an executable unit
//!
//! `setup.script` is reserved for the directory's lifecycle hooks.
//! Units apply in ascending order of their entry names, compared as plain
//! strings (`10-x` sorts before `2-x`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::feature::FeatureDefinition;
use crate::types::UnitKind;

pub const SCRIPT_EXTENSION: &str = "script";
pub const HOOKS_FILE: &str = "setup.script";
pub const NOTES_FILE: &str = "notes.txt";

/// A discovered change-unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeUnit {
    pub id: String,
    pub kind: UnitKind,
    pub path: PathBuf,
    pub notes: Option<String>,
}

/// The ordered set of units found in one directory.
#[derive(Debug, Clone)]
pub struct Catalog {
    dir: PathBuf,
    units: Vec<ChangeUnit>,
}

impl Catalog {
    pub fn units(&self) -> &[ChangeUnit] {
        &self.units
    }

    pub fn ids(&self) -> Vec<String> {
        self.units.iter().map(|u| u.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&ChangeUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Path of this directory's hook bundle, if one exists.
    pub fn hooks_path(&self) -> Option<PathBuf> {
        hooks_path(&self.dir)
    }
}

/// The hook bundle of catalog directory `dir`, if one exists.
pub fn hooks_path(dir: &Path) -> Option<PathBuf> {
    let path = dir.join(HOOKS_FILE);
    path.is_file().then_some(path)
}

/// Compiled exclusion patterns, matched against entry names.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    patterns: Vec<Regex>,
}

impl ExclusionSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    Error::Config(format!("invalid exclusion pattern '{}': {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }
}

/// Scan `dir` into an ordered unit catalog.
pub fn collect_units(dir: &Path, exclusions: &ExclusionSet) -> Result<Catalog> {
    let names = sorted_entry_names(dir)?;

    let mut units = Vec::new();
    let mut seen = HashSet::new();
    for name in names {
        if name.starts_with('.') || name == HOOKS_FILE || exclusions.is_excluded(&name) {
            continue;
        }
        let path = dir.join(&name);

        let (id, kind) = if path.is_dir() {
            (name.clone(), UnitKind::ArchiveBundle)
        } else if let Some(stem) = script_stem(&name) {
            (stem.to_string(), UnitKind::ExecutableScript)
        } else {
            continue;
        };

        if !seen.insert(id.clone()) {
            return Err(Error::Config(format!(
                "duplicate unit id '{}' in {}",
                id,
                dir.display()
            )));
        }

        let notes = match kind {
            UnitKind::ArchiveBundle => read_notes(&path)?,
            UnitKind::ExecutableScript => None,
        };

        units.push(ChangeUnit {
            id,
            kind,
            path,
            notes,
        });
    }

    debug!(dir = %dir.display(), count = units.len(), "collected units");
    Ok(Catalog {
        dir: dir.to_path_buf(),
        units,
    })
}

/// Scan `dir` for feature bundles: sub-directories with a descriptor.
pub fn collect_features(dir: &Path) -> Result<Vec<FeatureDefinition>> {
    let mut features: Vec<FeatureDefinition> = Vec::new();
    for name in sorted_entry_names(dir)? {
        let path = dir.join(&name);
        if name.starts_with('.') || !path.is_dir() {
            continue;
        }
        let Some(feature) = FeatureDefinition::load(&path)? else {
            continue;
        };
        if let Some(first) = features.iter().find(|f| f.name == feature.name) {
            return Err(Error::Config(format!(
                "duplicate feature name '{}' in {} and {}",
                feature.name,
                first.path.display(),
                feature.path.display()
            )));
        }
        features.push(feature);
    }
    Ok(features)
}

fn sorted_entry_names(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(Error::not_found("directory", dir.display().to_string()));
    }
    let mut names = std::fs::read_dir(dir)
        .map_err(|e| Error::io(dir, e))?
        .map(|entry| {
            entry
                .map(|e| e.file_name().to_string_lossy().to_string())
                .map_err(|e| Error::io(dir, e))
        })
        .collect::<Result<Vec<_>>>()?;
    names.sort();
    Ok(names)
}

fn script_stem(name: &str) -> Option<&str> {
    name.strip_suffix(SCRIPT_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .filter(|s| !s.is_empty())
}

fn read_notes(unit_dir: &Path) -> Result<Option<String>> {
    let path = unit_dir.join(NOTES_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

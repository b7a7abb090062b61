//! Caller variable overrides.
//!
//! Three sources, later wins: a JSON file, an inline JSON object, then
//! `KEY=VALUE` pairs. Pair values that parse as JSON keep their type;
//! anything else is taken as a string.

use std::path::PathBuf;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{VarMap, overlay};

#[derive(Debug, Clone, Default)]
pub struct VarSources {
    pub file: Option<PathBuf>,
    pub inline: Option<String>,
    pub pairs: Vec<String>,
}

impl VarSources {
    pub fn resolve(&self) -> Result<VarMap> {
        let mut vars = VarMap::new();

        if let Some(path) = &self.file {
            let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
            let layer = parse_object(&content)
                .map_err(|reason| Error::Config(format!("{}: {reason}", path.display())))?;
            overlay(&mut vars, &layer);
        }

        if let Some(inline) = &self.inline {
            let layer = parse_object(inline)
                .map_err(|reason| Error::Config(format!("inline variables: {reason}")))?;
            overlay(&mut vars, &layer);
        }

        for pair in &self.pairs {
            let (key, value) = parse_pair(pair)?;
            vars.insert(key, value);
        }

        Ok(vars)
    }
}

fn parse_object(text: &str) -> std::result::Result<VarMap, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_pair(pair: &str) -> Result<(String, Value)> {
    let (key, raw) = pair
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("invalid variable '{pair}', expected KEY=VALUE")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::Config(format!("invalid variable '{pair}', empty key")));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

//! TOML parser with helpful error messages

use std::path::Path;

use anyhow::{Context, Result};

use super::ProjectConfig;

/// Parse strata.toml with detailed error messages
pub fn parse_project_toml(path: &Path) -> Result<ProjectConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_project_toml_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse strata.toml content from string
pub fn parse_project_toml_str(content: &str) -> Result<ProjectConfig> {
    toml::from_str(content).map_err(|e| anyhow::anyhow!(describe_toml_error(&e, content)))
}

/// Render a TOML error with the offending lines when the span is known.
pub(crate) fn describe_toml_error(error: &toml::de::Error, content: &str) -> String {
    let message = error.message();
    match error.span() {
        Some(span) => {
            let line_num = content[..span.start.min(content.len())]
                .matches('\n')
                .count()
                + 1;
            format!(
                "TOML parsing error at line {}:\n{}\n\nError: {}",
                line_num,
                get_line_context(content, line_num),
                message
            )
        }
        None => format!("TOML parsing error: {message}"),
    }
}

/// Get context lines around an error
fn get_line_context(content: &str, line_num: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = line_num.saturating_sub(2).min(lines.len());
    let end = (line_num + 1).min(lines.len());

    lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let num = start + i + 1;
            let marker = if num == line_num { ">>>" } else { "   " };
            format!("{} {:4} | {}", marker, num, line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

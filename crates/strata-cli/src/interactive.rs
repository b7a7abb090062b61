//! Interactive answers for feature questions.
//!
//! Uses dialoguer for terminal UI prompts. Only built when stdin is a
//! terminal and `--yes` was not passed.

use anyhow::Result;
use console::style;
use dialoguer::{Confirm, Input, Password, Select, theme::ColorfulTheme};
use serde_json::Value;

use strata_core::feature::{Prompter, Question, QuestionKind};
use strata_core::types::VarMap;

#[derive(Default)]
pub struct DialoguerPrompter {
    theme: ColorfulTheme,
}

impl DialoguerPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    fn ask_one(&self, question: &Question, known: &VarMap) -> Result<Value> {
        let default = known
            .get(&question.name)
            .filter(|v| !v.is_null())
            .or(question.default.as_ref());

        let answer = match question.kind {
            QuestionKind::Input => {
                let mut input = Input::<String>::with_theme(&self.theme);
                input = input.with_prompt(&question.message);
                if let Some(default) = default {
                    input = input.default(display_value(default));
                }
                parse_answer(&input.interact_text()?)
            }
            QuestionKind::Confirm => {
                let default = default.and_then(Value::as_bool).unwrap_or(false);
                Value::Bool(
                    Confirm::with_theme(&self.theme)
                        .with_prompt(&question.message)
                        .default(default)
                        .interact()?,
                )
            }
            QuestionKind::Select => {
                if question.choices.is_empty() {
                    anyhow::bail!("Question '{}' has no choices", question.name);
                }
                let selected = default
                    .and_then(Value::as_str)
                    .and_then(|d| question.choices.iter().position(|c| c == d))
                    .unwrap_or(0);
                let index = Select::with_theme(&self.theme)
                    .with_prompt(&question.message)
                    .items(&question.choices)
                    .default(selected)
                    .interact()?;
                Value::String(question.choices[index].clone())
            }
            QuestionKind::Password => Value::String(
                Password::with_theme(&self.theme)
                    .with_prompt(&question.message)
                    .interact()?,
            ),
        };
        Ok(answer)
    }
}

impl Prompter for DialoguerPrompter {
    fn ask(&self, questions: &[Question], known: &VarMap) -> Result<VarMap> {
        println!();
        println!("{}", style("  Feature questions").bold().cyan());
        println!();

        let mut answers = VarMap::new();
        for question in questions {
            let answer = self.ask_one(question, known)?;
            answers.insert(question.name.clone(), answer);
        }
        Ok(answers)
    }
}

/// Text shown as an input default.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Typed answers keep their JSON type; everything else is a string.
fn parse_answer(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_answers_stay_numbers() {
        assert_eq!(parse_answer("24"), json!(24));
        assert_eq!(parse_answer("true"), json!(true));
    }

    #[test]
    fn test_other_answers_are_strings() {
        assert_eq!(parse_answer("storefront"), json!("storefront"));
        assert_eq!(parse_answer("[1]"), json!("[1]"));
        assert_eq!(parse_answer(""), json!(""));
    }

    #[test]
    fn test_default_prompter_is_usable_as_prompter() {
        let prompter = DialoguerPrompter::default();
        let as_prompter: &dyn Prompter = &prompter;
        // Nothing outstanding means nothing is asked.
        assert!(as_prompter.ask(&[], &VarMap::new()).unwrap().is_empty());
    }

    #[test]
    fn test_display_value_unquotes_strings() {
        assert_eq!(display_value(&json!("abc")), "abc");
        assert_eq!(display_value(&json!(3)), "3");
    }
}

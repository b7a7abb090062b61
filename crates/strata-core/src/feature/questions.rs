//! Deployment questions and the prompt seam.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::VarMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    #[default]
    Input,
    Confirm,
    Select,
    /// Input that must not be echoed.
    Password,
}

/// One variable a feature asks the operator for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Variable the answer is stored under.
    pub name: String,
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: QuestionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

/// Answers outstanding questions, typically by asking a human.
pub trait Prompter: Send + Sync {
    /// Return answers keyed by question name. `known` holds the merged
    /// variables so far, for use as defaults.
    fn ask(&self, questions: &[Question], known: &VarMap) -> anyhow::Result<VarMap>;
}

/// Questions whose variable has no value yet.
pub fn outstanding(questions: &[Question], vars: &VarMap) -> Vec<Question> {
    questions
        .iter()
        .filter(|q| vars.get(&q.name).is_none_or(Value::is_null))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn question(name: &str) -> Question {
        Question {
            name: name.to_string(),
            message: format!("{name}?"),
            kind: QuestionKind::Input,
            default: None,
            choices: Vec::new(),
        }
    }

    #[test]
    fn answered_questions_are_not_outstanding() {
        let vars = json!({"a": 1, "b": null}).as_object().unwrap().clone();
        let open = outstanding(&[question("a"), question("b"), question("c")], &vars);
        let names: Vec<_> = open.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn question_kind_defaults_to_input() {
        let q: Question = serde_json::from_value(json!({"name": "x", "message": "X?"})).unwrap();
        assert_eq!(q.kind, QuestionKind::Input);
        assert!(q.choices.is_empty());
    }
}

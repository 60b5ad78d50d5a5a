//! Submission text parsing.
//!
//! One record per line: `<label> <token>`. Labels cannot contain whitespace.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A task to be inserted, before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub label: String,
    pub token: String,
}

impl NewTask {
    pub fn new(label: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            token: token.into(),
        }
    }
}

/// Parse submission text into tasks in file order.
///
/// Blank lines are skipped. A token repeated later in the same text is
/// dropped, keeping the first occurrence.
pub fn parse_submission(text: &str) -> Result<Vec<NewTask>> {
    if text.trim().is_empty() {
        return Err(Error::Validation("submission is empty".to_string()));
    }

    let mut seen = HashSet::new();
    let mut tasks = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(label), Some(token), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(Error::Validation(format!(
                "line {}: expected \"<label> <token>\", got {line:?}",
                idx + 1
            )));
        };
        if seen.insert(token.to_string()) {
            tasks.push(NewTask::new(label, token));
        }
    }
    Ok(tasks)
}

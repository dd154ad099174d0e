use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result};

/// Validation rule spec understood by the iteration engine.
///
/// Modeled as a tagged variant so new rule types can be added without
/// touching existing consumers; the engine dispatches on the tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleSpec {
    /// Run a shell command; pass iff the exit code equals `expected_exit_code`.
    #[serde(rename_all = "camelCase")]
    Command {
        name: String,
        command: String,
        #[serde(default = "default_command_timeout_ms")]
        timeout_ms: u64,
        working_directory: Option<String>,
        #[serde(default)]
        expected_exit_code: i32,
    },
    /// Regex match against the task's latest work-product content.
    #[serde(rename_all = "camelCase")]
    WorkProductMatches { name: String, pattern: String },
    /// Regex match against the task's notes.
    #[serde(rename_all = "camelCase")]
    NotesMatch { name: String, pattern: String },
    /// Regex match against the agent output handed to `iteration_validate`.
    #[serde(rename_all = "camelCase")]
    OutputMatches { name: String, pattern: String },
}

pub fn default_command_timeout_ms() -> u64 {
    60_000
}

impl RuleSpec {
    pub fn name(&self) -> &str {
        match self {
            RuleSpec::Command { name, .. }
            | RuleSpec::WorkProductMatches { name, .. }
            | RuleSpec::NotesMatch { name, .. }
            | RuleSpec::OutputMatches { name, .. } => name,
        }
    }

    /// Structural well-formedness, checked at `iteration_start` time.
    pub fn validate(&self) -> Result<()> {
        if self.name().trim().is_empty() {
            return Err(CoordError::empty_field("rule name"));
        }
        match self {
            RuleSpec::Command {
                command, timeout_ms, ..
            } => {
                if command.trim().is_empty() {
                    return Err(CoordError::empty_field("rule command"));
                }
                if *timeout_ms == 0 {
                    return Err(CoordError::Validation(format!(
                        "Rule '{}' has a zero timeout",
                        self.name()
                    )));
                }
            }
            RuleSpec::WorkProductMatches { pattern, .. }
            | RuleSpec::NotesMatch { pattern, .. }
            | RuleSpec::OutputMatches { pattern, .. } => {
                regex::Regex::new(pattern).map_err(|e| {
                    CoordError::Validation(format!(
                        "Rule '{}' has an invalid pattern: {e}",
                        self.name()
                    ))
                })?;
            }
        }
        Ok(())
    }
}

/// Result of running one validation rule, returned in rule order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

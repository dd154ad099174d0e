use std::sync::RwLock;
use std::time::Instant;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoordError, Result};
use crate::models::Severity;

/// Action a security rule can demand for a tool call.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityAction {
    Allow,
    Warn,
    Block,
}

impl std::fmt::Display for SecurityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityAction::Allow => write!(f, "ALLOW"),
            SecurityAction::Warn => write!(f, "WARN"),
            SecurityAction::Block => write!(f, "BLOCK"),
        }
    }
}

/// One pattern inside a security rule. The first matching pattern decides
/// the rule's violation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPattern {
    pub pattern: String,
    pub action: SecurityAction,
    pub severity: Severity,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

/// Pre-tool-use rule stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    /// Higher priority evaluates first
    pub priority: i32,
    pub patterns: Vec<SecurityPattern>,
}

/// Violation reported by one rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityViolation {
    pub rule_name: String,
    pub action: SecurityAction,
    pub severity: Severity,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

/// Aggregate decision: any BLOCK wins, else any WARN, else ALLOW.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDecision {
    pub allowed: bool,
    pub action: SecurityAction,
    pub violations: Vec<SecurityViolation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
}

/// Input to the pre-tool-use pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub tool_name: String,
    pub tool_input: Value,
    #[serde(default)]
    pub metadata: Value,
}

/// Registry of pre-tool-use security rules.
///
/// Read-mostly; a reader/writer lock guards registration and toggling.
/// Seeded with the built-in destructive-command and secret-leak rules.
pub struct SecurityRegistry {
    rules: RwLock<Vec<SecurityRule>>,
    enabled: bool,
}

impl SecurityRegistry {
    pub fn new(enabled: bool) -> Self {
        Self {
            rules: RwLock::new(builtin_rules()),
            enabled,
        }
    }

    pub fn register(&self, rule: SecurityRule) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(CoordError::empty_field("rule id"));
        }
        if rule.name.trim().is_empty() {
            return Err(CoordError::empty_field("rule name"));
        }
        for pattern in &rule.patterns {
            RegexBuilder::new(&pattern.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    CoordError::Validation(format!(
                        "Rule '{}' has an invalid pattern: {e}",
                        rule.name
                    ))
                })?;
        }
        let mut rules = self.rules.write().expect("security registry lock poisoned");
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(CoordError::Validation(format!(
                "Security rule '{}' already registered",
                rule.id
            )));
        }
        rules.push(rule);
        Ok(())
    }

    pub fn list(&self) -> Vec<SecurityRule> {
        self.rules
            .read()
            .expect("security registry lock poisoned")
            .clone()
    }

    /// Enable or disable a rule by id; returns the new enabled state.
    pub fn toggle(&self, rule_id: &str, enabled: bool) -> Result<bool> {
        let mut rules = self.rules.write().expect("security registry lock poisoned");
        let rule = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| CoordError::not_found("Security rule", rule_id))?;
        rule.enabled = enabled;
        Ok(rule.enabled)
    }

    /// Evaluate enabled rules in descending priority order.
    pub fn evaluate(&self, tool_use: &ToolUse) -> SecurityDecision {
        if !self.enabled {
            return SecurityDecision {
                allowed: true,
                action: SecurityAction::Allow,
                violations: vec![],
                execution_time_ms: None,
            };
        }

        let haystack = collect_string_inputs(&tool_use.tool_input);
        let mut rules = self.list();
        rules.retain(|r| r.enabled);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut violations = Vec::new();
        for rule in &rules {
            if let Some(violation) = evaluate_rule(rule, &haystack) {
                violations.push(violation);
            }
        }

        let action = violations
            .iter()
            .fold(SecurityAction::Allow, |acc, v| match (acc, v.action) {
                (SecurityAction::Block, _) | (_, SecurityAction::Block) => SecurityAction::Block,
                (SecurityAction::Warn, _) | (_, SecurityAction::Warn) => SecurityAction::Warn,
                _ => SecurityAction::Allow,
            });

        SecurityDecision {
            allowed: action != SecurityAction::Block,
            action,
            violations,
            execution_time_ms: None,
        }
    }

    /// Dry-run evaluation for `hook_test_security`, with timing attached.
    pub fn test(&self, tool_use: &ToolUse) -> SecurityDecision {
        let started = Instant::now();
        let mut decision = self.evaluate(tool_use);
        decision.execution_time_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
        decision
    }

    /// Restore the built-in rule set; test hook.
    pub fn reset(&self) {
        *self.rules.write().expect("security registry lock poisoned") = builtin_rules();
    }
}

fn evaluate_rule(rule: &SecurityRule, haystack: &str) -> Option<SecurityViolation> {
    for pattern in &rule.patterns {
        let re = RegexBuilder::new(&pattern.pattern)
            .case_insensitive(true)
            .build()
            .ok()?;
        if re.is_match(haystack) {
            return Some(SecurityViolation {
                rule_name: rule.name.clone(),
                action: pattern.action,
                severity: pattern.severity,
                reason: pattern.reason.clone(),
                matched_pattern: Some(pattern.pattern.clone()),
                recommendation: pattern.recommendation.clone(),
            });
        }
    }
    None
}

/// Concatenate all string-valued entries of the tool input with newlines.
fn collect_string_inputs(input: &Value) -> String {
    let mut parts = Vec::new();
    collect_strings(input, &mut parts);
    parts.join("\n")
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Object(map) => {
            for v in map.values() {
                collect_strings(v, out);
            }
        }
        Value::Array(arr) => {
            for v in arr {
                collect_strings(v, out);
            }
        }
        _ => {}
    }
}

fn builtin_rules() -> Vec<SecurityRule> {
    vec![
        SecurityRule {
            id: "destructive-commands".into(),
            name: "Destructive command guard".into(),
            description: "Blocks recursive deletes and whole-disk writes".into(),
            enabled: true,
            priority: 100,
            patterns: vec![
                SecurityPattern {
                    pattern: r"rm\s+(-[a-z]*r[a-z]*f|-[a-z]*f[a-z]*r)\s+/(?:\s|$)".into(),
                    action: SecurityAction::Block,
                    severity: Severity::Critical,
                    reason: "Recursive force delete of the filesystem root".into(),
                    recommendation: Some("Scope the delete to an explicit project path".into()),
                },
                SecurityPattern {
                    pattern: r"\bmkfs\.|dd\s+if=.*of=/dev/".into(),
                    action: SecurityAction::Block,
                    severity: Severity::Critical,
                    reason: "Raw device write".into(),
                    recommendation: None,
                },
            ],
        },
        SecurityRule {
            id: "credential-exposure".into(),
            name: "Credential exposure".into(),
            description: "Warns when tool input appears to carry secrets".into(),
            enabled: true,
            priority: 50,
            patterns: vec![SecurityPattern {
                pattern: r"(api[_-]?key|secret|password|token)\s*[:=]\s*\S+".into(),
                action: SecurityAction::Warn,
                severity: Severity::Medium,
                reason: "Possible secret in tool input".into(),
                recommendation: Some("Move secrets into environment configuration".into()),
            }],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_use(input: Value) -> ToolUse {
        ToolUse {
            tool_name: "bash".into(),
            tool_input: input,
            metadata: Value::Null,
        }
    }

    #[test]
    fn test_block_beats_warn() {
        let registry = SecurityRegistry::new(true);
        let decision = registry.evaluate(&tool_use(json!({
            "command": "rm -rf / ",
            "note": "password: hunter2"
        })));
        assert!(!decision.allowed);
        assert_eq!(decision.action, SecurityAction::Block);
        assert!(decision.violations.len() >= 2);
    }

    #[test]
    fn test_warn_only() {
        let registry = SecurityRegistry::new(true);
        let decision = registry.evaluate(&tool_use(json!({"env": "API_KEY=abc123"})));
        assert!(decision.allowed);
        assert_eq!(decision.action, SecurityAction::Warn);
    }

    #[test]
    fn test_clean_input_allows() {
        let registry = SecurityRegistry::new(true);
        let decision = registry.evaluate(&tool_use(json!({"command": "cargo build"})));
        assert!(decision.allowed);
        assert_eq!(decision.action, SecurityAction::Allow);
        assert!(decision.violations.is_empty());
    }

    #[test]
    fn test_disabled_pipeline_always_allows() {
        let registry = SecurityRegistry::new(false);
        let decision = registry.evaluate(&tool_use(json!({"command": "rm -rf / "})));
        assert!(decision.allowed);
    }

    #[test]
    fn test_priority_order_and_first_match_wins() {
        let registry = SecurityRegistry::new(true);
        registry
            .register(SecurityRule {
                id: "two-patterns".into(),
                name: "Two patterns".into(),
                description: String::new(),
                enabled: true,
                priority: 200,
                patterns: vec![
                    SecurityPattern {
                        pattern: "alpha".into(),
                        action: SecurityAction::Warn,
                        severity: Severity::Low,
                        reason: "first".into(),
                        recommendation: None,
                    },
                    SecurityPattern {
                        pattern: "alpha beta".into(),
                        action: SecurityAction::Block,
                        severity: Severity::High,
                        reason: "second".into(),
                        recommendation: None,
                    },
                ],
            })
            .unwrap();

        let decision = registry.evaluate(&tool_use(json!({"command": "alpha beta"})));
        // First pattern matched first, so the rule reports WARN, not BLOCK
        assert_eq!(decision.violations[0].reason, "first");
        assert_eq!(decision.action, SecurityAction::Warn);
    }

    #[test]
    fn test_toggle_and_reset() {
        let registry = SecurityRegistry::new(true);
        assert!(!registry.toggle("destructive-commands", false).unwrap());
        let decision = registry.evaluate(&tool_use(json!({"command": "rm -rf / "})));
        assert!(decision.allowed);

        registry.reset();
        let decision = registry.evaluate(&tool_use(json!({"command": "rm -rf / "})));
        assert!(!decision.allowed);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let registry = SecurityRegistry::new(true);
        let result = registry.register(SecurityRule {
            id: "bad".into(),
            name: "Bad".into(),
            description: String::new(),
            enabled: true,
            priority: 0,
            patterns: vec![SecurityPattern {
                pattern: "(unclosed".into(),
                action: SecurityAction::Warn,
                severity: Severity::Low,
                reason: "x".into(),
                recommendation: None,
            }],
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_test_measures_execution_time() {
        let registry = SecurityRegistry::new(true);
        let decision = registry.test(&tool_use(json!({"command": "ls"})));
        assert!(decision.execution_time_ms.is_some());
    }
}

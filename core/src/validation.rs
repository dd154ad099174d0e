use serde::{Deserialize, Serialize};

use crate::models::WorkProduct;

/// Outcome of one work-product validator.
///
/// Validation is advisory except for reject: warnings and flags ride along
/// with the stored product, a reject aborts the store call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ValidatorOutcome {
    Pass,
    Warn { message: String },
    Flag { message: String },
    Reject { message: String },
}

/// Pluggable work-product validator.
pub struct Validator {
    pub name: String,
    check: Box<dyn Fn(&WorkProduct) -> ValidatorOutcome + Send + Sync>,
}

impl Validator {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&WorkProduct) -> ValidatorOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }
}

/// Aggregated validation report attached to a stored work-product.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub warnings: Vec<String>,
    pub flags: Vec<String>,
    pub rejections: Vec<String>,
}

impl ValidationReport {
    pub fn rejected(&self) -> bool {
        !self.rejections.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.flags.is_empty() && self.rejections.is_empty()
    }

    /// Actionable feedback string for a rejected store call.
    pub fn rejection_feedback(&self) -> String {
        self.rejections.join("; ")
    }
}

/// Registry of work-product validators, run at `work_product_store` time.
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: Vec<Validator>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the stock validators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Validator::new("non-empty-content", |wp| {
            if wp.content.trim().is_empty() {
                ValidatorOutcome::Reject {
                    message: "Work product content is empty; store the actual deliverable".into(),
                }
            } else {
                ValidatorOutcome::Pass
            }
        }));
        registry.register(Validator::new("truncation-marker", |wp| {
            if wp.content.contains("[TRUNCATED]") {
                ValidatorOutcome::Warn {
                    message: "Content carries a truncation marker; the deliverable may be partial"
                        .into(),
                }
            } else {
                ValidatorOutcome::Pass
            }
        }));
        registry.register(Validator::new("unresolved-placeholders", |wp| {
            if wp.content.contains("TBD") || wp.content.contains("FIXME") {
                ValidatorOutcome::Flag {
                    message: "Content contains unresolved TBD/FIXME placeholders".into(),
                }
            } else {
                ValidatorOutcome::Pass
            }
        }));
        registry
    }

    pub fn register(&mut self, validator: Validator) {
        self.validators.push(validator);
    }

    pub fn run(&self, product: &WorkProduct) -> ValidationReport {
        let mut report = ValidationReport::default();
        for validator in &self.validators {
            match (validator.check)(product) {
                ValidatorOutcome::Pass => {}
                ValidatorOutcome::Warn { message } => {
                    report.warnings.push(format!("{}: {message}", validator.name));
                }
                ValidatorOutcome::Flag { message } => {
                    report.flags.push(format!("{}: {message}", validator.name));
                }
                ValidatorOutcome::Reject { message } => {
                    report
                        .rejections
                        .push(format!("{}: {message}", validator.name));
                }
            }
        }
        report
    }
}

/// First `max` characters of a text, on char boundaries.
pub fn summarize(content: &str, max: usize) -> String {
    content.chars().take(max).collect()
}

/// Whitespace-split word count.
pub fn word_count(content: &str) -> usize {
    content.split_whitespace().count()
}

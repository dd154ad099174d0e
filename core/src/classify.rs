use std::sync::OnceLock;

use regex::Regex;

use crate::models::{ActivationMode, PrdType};

fn word_regex(words: &[&str]) -> Regex {
    let pattern = format!(r"(?i)\b(?:{})\b", words.join("|"));
    Regex::new(&pattern).expect("static keyword pattern")
}

fn defect_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| word_regex(&["fix", "bug", "error", "broken", "issue", "crash", "fail"]))
}

fn question_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        word_regex(&[
            "how",
            "what",
            "why",
            "explain",
            "investigate",
            "research",
            "explore",
        ])
    })
}

fn experience_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        word_regex(&[
            "ui",
            "ux",
            "design",
            "interface",
            "modal",
            "form",
            "screen",
            "page",
            "layout",
            "component",
            "visual",
            "interaction",
        ])
    })
}

fn feature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        word_regex(&[
            "add",
            "implement",
            "create",
            "build",
            "develop",
            "introduce",
            "enable",
        ])
    })
}

/// Classify a PRD from its title and description.
///
/// Fixed keyword classifier with whole-word matching; categories are tried
/// in priority order DEFECT, QUESTION, EXPERIENCE, FEATURE, falling back to
/// TECHNICAL.
pub fn classify_prd(title: &str, description: &str) -> PrdType {
    let text = format!("{title} {description}");
    if defect_re().is_match(&text) {
        PrdType::Defect
    } else if question_re().is_match(&text) {
        PrdType::Question
    } else if experience_re().is_match(&text) {
        PrdType::Experience
    } else if feature_re().is_match(&text) {
        PrdType::Feature
    } else {
        PrdType::Technical
    }
}

fn activation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(ultrawork|analyze|analysis|analyse|quick|fast|rapid|thorough|comprehensive|detailed|in-depth)\b",
        )
        .expect("static activation pattern")
    })
}

/// Detect an activation mode from task title and description.
///
/// Whole-word, case-insensitive; when several keywords appear, the last
/// match wins. Explicit metadata always overrides detection.
pub fn detect_activation_mode(title: &str, description: &str) -> Option<ActivationMode> {
    let text = format!("{title} {description}");
    let last = activation_re().find_iter(&text).last()?;
    let mode = match last.as_str().to_ascii_lowercase().as_str() {
        "ultrawork" => ActivationMode::Ultrawork,
        "analyze" | "analysis" | "analyse" => ActivationMode::Analyze,
        "quick" | "fast" | "rapid" => ActivationMode::Quick,
        "thorough" | "comprehensive" | "detailed" | "in-depth" => ActivationMode::Thorough,
        _ => return None,
    };
    Some(mode)
}

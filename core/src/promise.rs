use regex::Regex;
use serde::{Deserialize, Serialize};

/// Signal returned by `iteration_validate`.
///
/// Priority when multiple sources fire: BLOCKED > COMPLETE > ESCALATE >
/// CONTINUE.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompletionSignal {
    Continue,
    Complete,
    Blocked,
    Escalate,
}

impl CompletionSignal {
    fn rank(self) -> u8 {
        match self {
            CompletionSignal::Blocked => 3,
            CompletionSignal::Complete => 2,
            CompletionSignal::Escalate => 1,
            CompletionSignal::Continue => 0,
        }
    }

    /// Combine two signals, keeping the higher-priority one.
    pub fn max(self, other: CompletionSignal) -> CompletionSignal {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionSignal::Continue => "CONTINUE",
            CompletionSignal::Complete => "COMPLETE",
            CompletionSignal::Blocked => "BLOCKED",
            CompletionSignal::Escalate => "ESCALATE",
        };
        write!(f, "{s}")
    }
}

/// How many trailing characters the continuation guard inspects.
pub const GUARD_WINDOW: usize = 100;

fn tag_regex(tag_type: &str) -> Regex {
    // The tag pair is fixed grammar; never parse arbitrary XML.
    Regex::new(&format!(
        r"(?i)<promise>\s*{}\s*</promise>",
        regex::escape(tag_type)
    ))
    .expect("static promise pattern")
}

/// Detect a `<promise>TYPE</promise>` tag in agent output.
///
/// Returns the tag plus any trailing context up to the next blank line, so
/// callers see the sentence the agent attached to its promise.
pub fn detect_promise_by_tag(output: &str, tag_type: &str) -> Option<String> {
    let m = tag_regex(tag_type).find(output)?;
    let rest = &output[m.start()..];
    let end = rest.find("\n\n").unwrap_or(rest.len());
    Some(rest[..end].trim_end().to_string())
}

/// Explicit continuation request the outer session may emit.
pub fn continuation_requested(output: &str) -> bool {
    static_thinking_re().is_match(output)
}

fn static_thinking_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<thinking>\s*CONTINUATION_NEEDED\s*</thinking>").expect("static pattern")
    })
}

/// Suffix window of the last `GUARD_WINDOW` characters (not bytes).
pub fn suffix_window(output: &str) -> &str {
    let count = output.chars().count();
    if count <= GUARD_WINDOW {
        return output;
    }
    let skip = count - GUARD_WINDOW;
    let (idx, _) = output.char_indices().nth(skip).expect("index within bounds");
    &output[idx..]
}

/// Continuation-guard probe: did the output end without a terminal promise?
///
/// Returns true ("incomplete") when neither `<promise>COMPLETE</promise>`
/// nor `<promise>BLOCKED</promise>` occurs in the final window.
pub fn ends_without_promise(output: &str) -> bool {
    let suffix = suffix_window(output);
    detect_promise_by_tag(suffix, "COMPLETE").is_none()
        && detect_promise_by_tag(suffix, "BLOCKED").is_none()
}

/// Legacy substring scan: which configured promises appear verbatim in the
/// agent output.
pub fn detect_configured_promises(output: &str, configured: &[String]) -> Vec<String> {
    configured
        .iter()
        .filter(|p| !p.is_empty() && output.contains(p.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_detection_case_insensitive() {
        assert!(detect_promise_by_tag("done <promise>complete</promise>", "COMPLETE").is_some());
        assert!(detect_promise_by_tag("done <PROMISE>Complete</PROMISE>", "COMPLETE").is_some());
        assert!(detect_promise_by_tag("<promise>COMPLETE</promise>", "complete").is_some());
        assert!(detect_promise_by_tag("<promise>BLOCKED</promise>", "COMPLETE").is_none());
    }

    #[test]
    fn test_tag_detection_captures_trailing_context() {
        let output = "work log\n<promise>COMPLETE</promise> all tests green\nsee notes\n\nunrelated";
        let detected = detect_promise_by_tag(output, "COMPLETE").unwrap();
        assert!(detected.starts_with("<promise>COMPLETE</promise>"));
        assert!(detected.contains("all tests green"));
        assert!(detected.contains("see notes"));
        assert!(!detected.contains("unrelated"));
    }

    #[test]
    fn test_guard_recognizes_promise_at_window_edge() {
        let promise = "<promise>COMPLETE</promise>";
        // Promise begins exactly at position len - 100
        let padding_after = GUARD_WINDOW - promise.len();
        let output = format!("{}{}{}", "x".repeat(500), promise, "y".repeat(padding_after));
        assert!(!ends_without_promise(&output));

        // One character earlier and the tag is clipped out of the window
        let output = format!(
            "{}{}{}",
            "x".repeat(500),
            promise,
            "y".repeat(padding_after + 1)
        );
        assert!(ends_without_promise(&output));
    }

    #[test]
    fn test_guard_short_output() {
        assert!(ends_without_promise("still working"));
        assert!(!ends_without_promise("<promise>BLOCKED</promise> missing creds"));
    }

    #[test]
    fn test_suffix_window_multibyte() {
        let output = format!("{}<promise>COMPLETE</promise>", "é".repeat(200));
        // Must not panic on char boundaries and must still find the tag
        assert!(!ends_without_promise(&output));
    }

    #[test]
    fn test_signal_priority() {
        use CompletionSignal::*;
        assert_eq!(Continue.max(Complete), Complete);
        assert_eq!(Complete.max(Blocked), Blocked);
        assert_eq!(Blocked.max(Escalate), Blocked);
        assert_eq!(Continue.max(Escalate), Escalate);
    }

    #[test]
    fn test_continuation_request_tag() {
        assert!(continuation_requested("<thinking>CONTINUATION_NEEDED</thinking>"));
        assert!(continuation_requested("<thinking> continuation_needed </thinking>"));
        assert!(!continuation_requested("<thinking>done</thinking>"));
    }

    #[test]
    fn test_legacy_substring_scan() {
        let configured = vec![
            "<promise>COMPLETE</promise>".to_string(),
            "ALL_DONE".to_string(),
        ];
        let found = detect_configured_promises("x ALL_DONE y", &configured);
        assert_eq!(found, vec!["ALL_DONE".to_string()]);
    }
}

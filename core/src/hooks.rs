use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::promise;

/// Verdict a stop hook can return for an iteration.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HookAction {
    Complete,
    Continue,
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookVerdict {
    pub action: HookAction,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_prompt: Option<String>,
}

/// Context handed to each hook by `iteration_validate`.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub iteration_id: String,
    pub agent_output: String,
    pub files_modified: Option<Vec<String>>,
    /// Outcome of the configured validation rules, when any ran this cycle
    pub validation_passed: Option<bool>,
}

/// Canned stop-hook behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    /// Complete on a COMPLETE tag, otherwise continue
    Default,
    /// Trust the validation rules over the agent's own claim
    ValidationBiased,
    /// Require the promise tag; nudge the agent toward emitting it
    PromiseBiased,
}

/// Per-task stop hook, evaluated in registration order.
#[derive(Debug, Clone)]
pub struct StopHook {
    pub name: String,
    kind: HookKind,
}

impl StopHook {
    pub fn default_hook() -> Self {
        Self {
            name: "default".into(),
            kind: HookKind::Default,
        }
    }

    pub fn validation_biased() -> Self {
        Self {
            name: "validation-biased".into(),
            kind: HookKind::ValidationBiased,
        }
    }

    pub fn promise_biased() -> Self {
        Self {
            name: "promise-biased".into(),
            kind: HookKind::PromiseBiased,
        }
    }

    pub fn evaluate(&self, ctx: &HookContext) -> HookVerdict {
        let has_complete_tag =
            promise::detect_promise_by_tag(&ctx.agent_output, "COMPLETE").is_some();
        match self.kind {
            HookKind::Default => {
                if has_complete_tag {
                    HookVerdict {
                        action: HookAction::Complete,
                        reason: "Completion promise detected in agent output".into(),
                        next_prompt: None,
                    }
                } else {
                    HookVerdict {
                        action: HookAction::Continue,
                        reason: "No completion promise yet".into(),
                        next_prompt: None,
                    }
                }
            }
            HookKind::ValidationBiased => match ctx.validation_passed {
                Some(true) => HookVerdict {
                    action: HookAction::Complete,
                    reason: "Validation rules passed".into(),
                    next_prompt: None,
                },
                Some(false) => HookVerdict {
                    action: HookAction::Continue,
                    reason: "Validation rules failed".into(),
                    next_prompt: Some(
                        "Fix the failing validation rules before claiming completion".into(),
                    ),
                },
                None => HookVerdict {
                    action: HookAction::Continue,
                    reason: "No validation result available".into(),
                    next_prompt: None,
                },
            },
            HookKind::PromiseBiased => {
                if has_complete_tag {
                    HookVerdict {
                        action: HookAction::Complete,
                        reason: "Completion promise tag present".into(),
                        next_prompt: None,
                    }
                } else {
                    HookVerdict {
                        action: HookAction::Continue,
                        reason: "Waiting for an explicit completion promise".into(),
                        next_prompt: Some(
                            "End your output with <promise>COMPLETE</promise> when done".into(),
                        ),
                    }
                }
            }
        }
    }
}

/// In-memory per-task stop-hook registry, cleared when a task completes.
#[derive(Default)]
pub struct StopHookRegistry {
    hooks: Mutex<HashMap<String, Vec<StopHook>>>,
}

impl StopHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: &str, hook: StopHook) {
        self.hooks
            .lock()
            .expect("stop hook registry poisoned")
            .entry(task_id.to_string())
            .or_default()
            .push(hook);
    }

    pub fn has_hooks(&self, task_id: &str) -> bool {
        self.hooks
            .lock()
            .expect("stop hook registry poisoned")
            .get(task_id)
            .map(|h| !h.is_empty())
            .unwrap_or(false)
    }

    /// Evaluate hooks in registration order. Stops at the first
    /// non-continue verdict; otherwise returns the last continue verdict.
    pub fn evaluate(&self, task_id: &str, ctx: &HookContext) -> Option<HookVerdict> {
        let hooks = self.hooks.lock().expect("stop hook registry poisoned");
        let hooks = hooks.get(task_id)?;
        let mut last = None;
        for hook in hooks {
            let verdict = hook.evaluate(ctx);
            if verdict.action != HookAction::Continue {
                return Some(verdict);
            }
            last = Some(verdict);
        }
        last
    }

    pub fn clear_task(&self, task_id: &str) {
        self.hooks
            .lock()
            .expect("stop hook registry poisoned")
            .remove(task_id);
    }

    /// Drop every registration; test hook.
    pub fn reset(&self) {
        self.hooks
            .lock()
            .expect("stop hook registry poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(output: &str) -> HookContext {
        HookContext {
            iteration_id: "IT-1".into(),
            agent_output: output.into(),
            files_modified: None,
            validation_passed: None,
        }
    }

    #[test]
    fn test_default_hook_completes_on_tag() {
        let hook = StopHook::default_hook();
        assert_eq!(
            hook.evaluate(&ctx("done <promise>COMPLETE</promise>")).action,
            HookAction::Complete
        );
        assert_eq!(hook.evaluate(&ctx("still going")).action, HookAction::Continue);
    }

    #[test]
    fn test_validation_biased_hook() {
        let hook = StopHook::validation_biased();
        let mut context = ctx("whatever");
        context.validation_passed = Some(true);
        assert_eq!(hook.evaluate(&context).action, HookAction::Complete);

        context.validation_passed = Some(false);
        let verdict = hook.evaluate(&context);
        assert_eq!(verdict.action, HookAction::Continue);
        assert!(verdict.next_prompt.is_some());
    }

    #[test]
    fn test_promise_biased_prompts_for_tag() {
        let hook = StopHook::promise_biased();
        let verdict = hook.evaluate(&ctx("finished everything"));
        assert_eq!(verdict.action, HookAction::Continue);
        assert!(verdict.next_prompt.unwrap().contains("<promise>COMPLETE</promise>"));
    }

    #[test]
    fn test_registry_stops_at_first_non_continue() {
        let registry = StopHookRegistry::new();
        registry.register("TASK-1", StopHook::promise_biased());
        registry.register("TASK-1", StopHook::default_hook());

        let verdict = registry
            .evaluate("TASK-1", &ctx("done <promise>COMPLETE</promise>"))
            .unwrap();
        // First hook already returns complete
        assert_eq!(verdict.action, HookAction::Complete);
        assert_eq!(verdict.reason, "Completion promise tag present");
    }

    #[test]
    fn test_registry_returns_last_continue() {
        let registry = StopHookRegistry::new();
        registry.register("TASK-1", StopHook::default_hook());
        registry.register("TASK-1", StopHook::promise_biased());

        let verdict = registry.evaluate("TASK-1", &ctx("no tag here")).unwrap();
        assert_eq!(verdict.action, HookAction::Continue);
        assert_eq!(verdict.reason, "Waiting for an explicit completion promise");
    }

    #[test]
    fn test_clear_task() {
        let registry = StopHookRegistry::new();
        registry.register("TASK-1", StopHook::default_hook());
        assert!(registry.has_hooks("TASK-1"));
        registry.clear_task("TASK-1");
        assert!(!registry.has_hooks("TASK-1"));
        assert!(registry.evaluate("TASK-1", &ctx("x")).is_none());
    }
}

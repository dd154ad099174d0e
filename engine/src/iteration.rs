use chrono::Utc;
use coord_core::{
    error::{CoordError, Result},
    events::Event,
    hooks::{HookAction, HookContext, HookVerdict},
    id,
    models::{
        Checkpoint, CheckpointTrigger, IterationConfig, IterationHistoryEntry, Metadata, Task,
        TaskStatus,
    },
    promise::{self, CompletionSignal},
    rules::{RuleResult, RuleSpec},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::checkpoints::CheckpointCreateParams;
use crate::gates::GateReport;
use crate::runner::{run_rule, RuleInput};
use crate::Coordinator;

/// Continuation guard ceilings: warn at 5 auto-resumes, refuse at 10.
pub const CONTINUATION_WARN_AT: u64 = 5;
pub const CONTINUATION_BLOCK_AT: u64 = 10;
const CONTINUATION_REASON_WINDOW: usize = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationStartParams {
    pub task_id: String,
    pub max_iterations: u32,
    pub completion_promises: Vec<String>,
    #[serde(default)]
    pub validation_rules: Vec<RuleSpec>,
    pub circuit_breaker_threshold: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationStartResponse {
    pub iteration_id: String,
    pub task_id: String,
    pub iteration_number: u32,
    pub config: IterationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationValidateParams {
    pub iteration_id: String,
    pub agent_output: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationAction {
    AutoResume,
    Blocked,
    PromptUser,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationDecision {
    pub decision: ContinuationAction,
    pub reason: String,
    pub continuation_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationValidateResponse {
    pub iteration_number: u32,
    pub validation_passed: bool,
    pub completion_signal: CompletionSignal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_promise: Option<String>,
    pub feedback: Vec<String>,
    pub results: Vec<RuleResult>,
    /// Legacy substring scan of the configured promises
    pub completion_promises_detected: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_decision: Option<HookVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_decision: Option<ContinuationDecision>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationNextParams {
    pub iteration_id: String,
    pub validation_result: Option<bool>,
    pub agent_context: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationNextResponse {
    pub iteration_id: String,
    pub iteration_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationCompleteParams {
    pub iteration_id: String,
    pub completion_promise: String,
    pub work_product_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationCompleteResponse {
    pub iteration_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub total_iterations: u32,
    pub completion_promise: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_report: Option<GateReport>,
}

impl Coordinator {
    /// Begin a bounded iteration loop on a task. The loop's state lives on
    /// a single non-expiring iteration checkpoint.
    pub async fn iteration_start(
        &self,
        params: IterationStartParams,
    ) -> Result<IterationStartResponse> {
        let task = self
            .store
            .get_task(&params.task_id)
            .await?
            .ok_or_else(|| CoordError::not_found("Task", &params.task_id))?;

        if params.max_iterations < 1 {
            return Err(CoordError::Validation(
                "maxIterations must be at least 1".into(),
            ));
        }
        if params.completion_promises.is_empty()
            || params.completion_promises.iter().any(|p| p.trim().is_empty())
        {
            return Err(CoordError::Validation(
                "completionPromises must be a non-empty list of non-empty strings".into(),
            ));
        }
        let threshold = params.circuit_breaker_threshold.unwrap_or(3);
        if threshold < 1 {
            return Err(CoordError::Validation(
                "circuitBreakerThreshold must be at least 1".into(),
            ));
        }
        for rule in &params.validation_rules {
            rule.validate()?;
        }

        let config = IterationConfig {
            max_iterations: params.max_iterations,
            completion_promises: params.completion_promises,
            validation_rules: params.validation_rules,
            circuit_breaker_threshold: threshold,
        };

        let iteration_id = id::new_id(id::ITERATION);
        self.checkpoint_create(CheckpointCreateParams {
            task_id: task.id.clone(),
            trigger: Some(CheckpointTrigger::AutoIteration),
            iteration_config: Some(config.clone()),
            iteration_number: Some(1),
            id_override: Some(iteration_id.clone()),
            ..Default::default()
        })
        .await?;

        tracing::info!(
            iteration_id = iteration_id.as_str(),
            task_id = task.id.as_str(),
            max_iterations = config.max_iterations,
            "iteration loop started"
        );

        Ok(IterationStartResponse {
            iteration_id,
            task_id: task.id,
            iteration_number: 1,
            config,
        })
    }

    /// The core decision procedure: parse promises, run safety guards,
    /// consult stop hooks, run validation rules, run the continuation
    /// guard, and fold everything into one completion signal with the
    /// priority BLOCKED > COMPLETE > ESCALATE > CONTINUE.
    pub async fn iteration_validate(
        &self,
        params: IterationValidateParams,
    ) -> Result<IterationValidateResponse> {
        let checkpoint = self.load_iteration(&params.iteration_id).await?;
        let config = checkpoint
            .iteration_config
            .clone()
            .expect("iteration checkpoint carries a config");
        let iteration_number = checkpoint.iteration_number.unwrap_or(1);
        let history = &checkpoint.iteration_history;
        let output = params.agent_output.unwrap_or_default();

        let mut task = self
            .store
            .get_task(&checkpoint.task_id)
            .await?
            .ok_or_else(|| CoordError::not_found("Task", &checkpoint.task_id))?;

        // 1. Promise tags
        let blocked_tag = promise::detect_promise_by_tag(&output, "BLOCKED");
        let complete_tag = promise::detect_promise_by_tag(&output, "COMPLETE");
        let detected_promise = blocked_tag.clone().or_else(|| complete_tag.clone());

        // 2. Safety guards
        let mut feedback: Vec<String> = Vec::new();
        let escalate_reason = safety_escalation(iteration_number, &config, history);
        let safety_passed = escalate_reason.is_none();

        // 3. Base signal
        let mut signal = if blocked_tag.is_some() {
            CompletionSignal::Blocked
        } else if complete_tag.is_some() {
            CompletionSignal::Complete
        } else if let Some(reason) = &escalate_reason {
            feedback.push(reason.clone());
            CompletionSignal::Escalate
        } else {
            CompletionSignal::Continue
        };

        // 4. Stop hooks, only when safety passed
        let mut hook_decision = None;
        if safety_passed && self.stop_hooks.has_hooks(&task.id) {
            let ctx = HookContext {
                iteration_id: params.iteration_id.clone(),
                agent_output: output.clone(),
                files_modified: None,
                validation_passed: history.last().and_then(|h| h.validation_passed),
            };
            if let Some(verdict) = self.stop_hooks.evaluate(&task.id, &ctx) {
                if signal == CompletionSignal::Continue {
                    signal = match verdict.action {
                        HookAction::Complete => CompletionSignal::Complete,
                        HookAction::Escalate => CompletionSignal::Escalate,
                        HookAction::Continue => CompletionSignal::Continue,
                    };
                }
                hook_decision = Some(verdict);
            }
        }

        // 5. Validation rules
        let rule_input = RuleInput {
            agent_output: output.clone(),
            task_notes: task.notes.clone().unwrap_or_default(),
            latest_work_product: self
                .store
                .latest_work_product(&task.id)
                .await?
                .map(|wp| wp.content),
            project_root: self.options.project_root.clone(),
        };
        let mut results = Vec::with_capacity(config.validation_rules.len());
        for rule in &config.validation_rules {
            results.push(run_rule(rule, &rule_input).await);
        }
        let validation_passed = results.iter().all(|r| r.passed);
        if !matches!(
            signal,
            CompletionSignal::Blocked | CompletionSignal::Complete
        ) {
            for result in results.iter().filter(|r| !r.passed) {
                feedback.push(format!("[{}] {}", result.name, result.message));
            }
        }

        // 6. Persist validation state on the iteration checkpoint
        let state = json!({
            "iterationNumber": iteration_number,
            "validationPassed": validation_passed,
            "completionSignal": signal,
            "detectedPromise": detected_promise,
            "feedback": feedback,
            "timestamp": Utc::now(),
        });
        self.store
            .update_iteration_state(
                &checkpoint.id,
                iteration_number,
                history,
                Some(&state),
            )
            .await?;

        // 7. Continuation guard over the output's suffix window
        let continuation_decision = if signal == CompletionSignal::Complete {
            clear_continuation(&mut task.metadata);
            self.store.update_task_row(&task).await?;
            None
        } else {
            let incomplete =
                promise::ends_without_promise(&output) || promise::continuation_requested(&output);
            if incomplete {
                Some(
                    self.decide_continuation(&mut task, iteration_number, &config)
                        .await?,
                )
            } else {
                None
            }
        };

        Ok(IterationValidateResponse {
            iteration_number,
            validation_passed,
            completion_signal: signal,
            detected_promise,
            feedback,
            results,
            completion_promises_detected: promise::detect_configured_promises(
                &output,
                &config.completion_promises,
            ),
            hook_decision,
            continuation_decision,
        })
    }

    /// Advance the loop to the next iteration, recording the finished one
    /// in history.
    pub async fn iteration_next(&self, params: IterationNextParams) -> Result<IterationNextResponse> {
        let checkpoint = self.load_iteration(&params.iteration_id).await?;
        let config = checkpoint
            .iteration_config
            .clone()
            .expect("iteration checkpoint carries a config");
        let iteration_number = checkpoint.iteration_number.unwrap_or(1);

        if iteration_number >= config.max_iterations {
            return Err(CoordError::Validation(format!(
                "Iteration {iteration_number} is already at the configured maximum {}",
                config.max_iterations
            )));
        }

        // Auto-checkpoint snapshots the task as the new iteration begins
        let snapshot_id = if self.options.auto_checkpoint {
            let snapshot = self
                .checkpoint_create(CheckpointCreateParams {
                    task_id: checkpoint.task_id.clone(),
                    trigger: Some(CheckpointTrigger::AutoIteration),
                    agent_context: params.agent_context.clone(),
                    ..Default::default()
                })
                .await?;
            Some(snapshot.id)
        } else {
            None
        };

        let mut history = checkpoint.iteration_history.clone();
        history.push(IterationHistoryEntry {
            iteration: iteration_number,
            timestamp: Utc::now(),
            validation_passed: params.validation_result,
            checkpoint_id: snapshot_id.clone(),
        });

        let next_number = iteration_number + 1;
        self.store
            .update_iteration_state(&checkpoint.id, next_number, &history, None)
            .await?;

        self.events.emit(Event::IterationAdvanced {
            iteration_id: checkpoint.id.clone(),
            task_id: checkpoint.task_id.clone(),
            iteration_number: next_number,
        });

        Ok(IterationNextResponse {
            iteration_id: checkpoint.id,
            iteration_number: next_number,
            checkpoint_id: snapshot_id,
        })
    }

    /// Close the loop. The promise must be one of the configured ones,
    /// verbatim; completion runs the same quality-gate transition as
    /// `task_update`.
    pub async fn iteration_complete(
        &self,
        params: IterationCompleteParams,
    ) -> Result<IterationCompleteResponse> {
        let checkpoint = self.load_iteration(&params.iteration_id).await?;
        let config = checkpoint
            .iteration_config
            .clone()
            .expect("iteration checkpoint carries a config");
        let iteration_number = checkpoint.iteration_number.unwrap_or(1);

        if !config
            .completion_promises
            .iter()
            .any(|p| p == &params.completion_promise)
        {
            return Err(CoordError::Validation(format!(
                "Completion promise '{}' is not one of the configured promises",
                params.completion_promise
            )));
        }
        if let Some(ref wp_id) = params.work_product_id {
            if self.store.get_work_product(wp_id).await?.is_none() {
                return Err(CoordError::not_found("Work product", wp_id));
            }
        }

        let mut task = self
            .store
            .get_task(&checkpoint.task_id)
            .await?
            .ok_or_else(|| CoordError::not_found("Task", &checkpoint.task_id))?;
        let old_status = task.status;

        let gate_report = self.apply_completion_transition(&mut task).await?;

        if task.status == TaskStatus::Completed {
            let note = format!("Iteration completed: {}", params.completion_promise);
            task.notes = Some(match &task.notes {
                Some(existing) => format!("{existing}\n{note}"),
                None => note,
            });
            task.metadata.insert(
                "iterationComplete".into(),
                json!({
                    "completedAt": Utc::now(),
                    "totalIterations": iteration_number,
                    "completionPromise": params.completion_promise,
                    "workProductId": params.work_product_id,
                }),
            );
            clear_continuation(&mut task.metadata);
            self.stop_hooks.clear_task(&task.id);
        }

        self.store.update_task_row(&task).await?;

        if task.status != old_status {
            let initiative = self.initiative_for_task(&task).await?;
            self.store
                .append_activity(
                    &initiative,
                    "task",
                    &task.id,
                    "status_changed",
                    &format!("{old_status} → {}", task.status),
                    &Metadata::new(),
                )
                .await?;
            self.events.emit(Event::TaskStatusChanged {
                task_id: task.id.clone(),
                from: old_status,
                to: task.status,
            });
        }
        if task.status == TaskStatus::Completed {
            if let Some(agent) = task.assigned_agent.clone() {
                self.record_performance(&task, &agent, coord_core::models::PerformanceOutcome::Success)
                    .await?;
            }
            self.events.emit(Event::IterationCompleted {
                iteration_id: checkpoint.id.clone(),
                task_id: task.id.clone(),
            });
        }

        Ok(IterationCompleteResponse {
            iteration_id: checkpoint.id,
            task_id: task.id.clone(),
            status: task.status,
            total_iterations: iteration_number,
            completion_promise: params.completion_promise,
            gate_report,
        })
    }

    async fn load_iteration(&self, iteration_id: &str) -> Result<Checkpoint> {
        let checkpoint = self
            .store
            .get_checkpoint(iteration_id)
            .await?
            .ok_or_else(|| CoordError::not_found("Iteration", iteration_id))?;
        if !checkpoint.is_iteration() {
            return Err(CoordError::Validation(format!(
                "Checkpoint {iteration_id} is not an iteration checkpoint"
            )));
        }
        Ok(checkpoint)
    }

    /// Continuation-guard decision when output ended without a terminal
    /// promise. Auto-resume bookkeeping lives in task metadata.
    async fn decide_continuation(
        &self,
        task: &mut Task,
        iteration_number: u32,
        config: &IterationConfig,
    ) -> Result<ContinuationDecision> {
        let (count, mut reasons) = read_continuation(&task.metadata);

        if count >= CONTINUATION_BLOCK_AT {
            return Ok(ContinuationDecision {
                decision: ContinuationAction::Blocked,
                reason: format!(
                    "Continuation limit reached ({count} auto-resumes); manual intervention required"
                ),
                continuation_count: count,
                warning: None,
            });
        }

        if iteration_number < config.max_iterations {
            let reason = format!(
                "Output ended without a completion promise during iteration {iteration_number}"
            );
            reasons.push(reason.clone());
            if reasons.len() > CONTINUATION_REASON_WINDOW {
                let drop = reasons.len() - CONTINUATION_REASON_WINDOW;
                reasons.drain(..drop);
            }
            let new_count = count + 1;
            write_continuation(&mut task.metadata, new_count, &reasons);
            self.store.update_task_row(task).await?;

            let warning = (new_count >= CONTINUATION_WARN_AT).then(|| {
                format!(
                    "{new_count} auto-resumes so far; the loop blocks at {CONTINUATION_BLOCK_AT}"
                )
            });
            return Ok(ContinuationDecision {
                decision: ContinuationAction::AutoResume,
                reason,
                continuation_count: new_count,
                warning,
            });
        }

        Ok(ContinuationDecision {
            decision: ContinuationAction::PromptUser,
            reason: "Iteration budget exhausted without a completion promise".into(),
            continuation_count: count,
            warning: None,
        })
    }
}

/// ESCALATE reasons from the safety guards: iteration ceiling, then the
/// circuit breaker over consecutive failed validations.
fn safety_escalation(
    iteration_number: u32,
    config: &IterationConfig,
    history: &[IterationHistoryEntry],
) -> Option<String> {
    if iteration_number >= config.max_iterations {
        return Some(format!(
            "Iteration {iteration_number} reached the configured maximum of {}",
            config.max_iterations
        ));
    }
    let threshold = config.circuit_breaker_threshold as usize;
    if history.len() >= threshold {
        let recent = &history[history.len() - threshold..];
        if recent.iter().all(|h| h.validation_passed == Some(false)) {
            return Some(format!(
                "Circuit breaker tripped: the last {threshold} iterations all failed validation"
            ));
        }
    }
    None
}

fn read_continuation(metadata: &Metadata) -> (u64, Vec<String>) {
    let Some(continuation) = metadata.get("continuation") else {
        return (0, vec![]);
    };
    let count = continuation
        .get("count")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let reasons = continuation
        .get("reasons")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    (count, reasons)
}

fn write_continuation(metadata: &mut Metadata, count: u64, reasons: &[String]) {
    metadata.insert(
        "continuation".into(),
        json!({ "count": count, "reasons": reasons }),
    );
}

fn clear_continuation(metadata: &mut Metadata) {
    metadata.remove("continuation");
}

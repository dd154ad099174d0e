use chrono::{DateTime, Duration, Utc};
use coord_core::{
    error::{CoordError, Result},
    events::Event,
    id,
    models::{Checkpoint, CheckpointTrigger, IterationConfig, Metadata, SubtaskState, Task, TaskStatus},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::Coordinator;

/// Manual checkpoints live a week, automatic ones a day. Iteration
/// checkpoints never expire.
pub const MANUAL_TTL_MINUTES: i64 = 7 * 24 * 60;
pub const AUTO_TTL_MINUTES: i64 = 24 * 60;

/// Draft content beyond this is truncated with a trailing marker.
pub const DRAFT_LIMIT_BYTES: usize = 50 * 1024;
pub const TRUNCATION_MARKER: &str = "\n\n[TRUNCATED]";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointCreateParams {
    pub task_id: String,
    pub trigger: Option<CheckpointTrigger>,
    pub execution_phase: Option<String>,
    pub execution_step: Option<String>,
    pub agent_context: Option<Value>,
    pub draft_content: Option<String>,
    pub draft_type: Option<String>,
    pub iteration_config: Option<IterationConfig>,
    pub iteration_number: Option<u32>,
    pub pause_metadata: Option<PauseMetadata>,
    /// Explicit TTL override, in minutes
    pub expires_in: Option<i64>,
    /// Internal: lets the iteration engine name its checkpoint with the
    /// iteration id. Not part of the wire surface.
    #[serde(skip)]
    pub id_override: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseMetadata {
    pub pause_reason: Option<String>,
    pub paused_by: Option<String>,
    pub next_steps: Option<Vec<String>>,
    pub blockers: Option<Vec<String>>,
    pub key_files: Option<Vec<String>>,
    pub estimated_resume_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResumeParams {
    pub task_id: String,
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskSummary {
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
    pub blocked: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResumeResponse {
    pub checkpoint_id: String,
    pub task_id: String,
    pub sequence: i64,
    pub restored_status: TaskStatus,
    pub execution_phase: Option<String>,
    pub execution_step: Option<String>,
    pub agent_context: Option<Value>,
    pub has_draft: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_type: Option<String>,
    pub subtask_summary: SubtaskSummary,
    pub resume_instructions: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_config: Option<IterationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_number: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub iteration_history: Vec<coord_core::models::IterationHistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_promises: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointCleanupParams {
    /// Remove checkpoints created more than this many minutes ago
    pub older_than_minutes: Option<i64>,
    pub task_id: Option<String>,
    /// For the given task, keep only the N newest
    pub keep_latest: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointCleanupResponse {
    pub deleted: u64,
    pub remaining: i64,
}

impl Coordinator {
    /// Snapshot a task into a new checkpoint.
    pub async fn checkpoint_create(&self, params: CheckpointCreateParams) -> Result<Checkpoint> {
        let task = self
            .store
            .get_task(&params.task_id)
            .await?
            .ok_or_else(|| CoordError::not_found("Task", &params.task_id))?;

        let trigger = params.trigger.unwrap_or(CheckpointTrigger::Manual);
        let now = Utc::now();
        let is_iteration = params.iteration_config.is_some();

        let expires_at = if is_iteration {
            None
        } else if let Some(minutes) = params.expires_in {
            Some(now + Duration::minutes(minutes))
        } else if trigger == CheckpointTrigger::Manual {
            Some(now + Duration::minutes(MANUAL_TTL_MINUTES))
        } else {
            Some(now + Duration::minutes(AUTO_TTL_MINUTES))
        };

        let agent_context = merge_pause_metadata(params.agent_context, params.pause_metadata, now);
        let draft_content = params.draft_content.map(|draft| truncate_draft(&draft));

        let subtask_states = self
            .store
            .subtasks(&task.id)
            .await?
            .into_iter()
            .map(|sub| SubtaskState {
                id: sub.id,
                status: sub.status,
            })
            .collect();

        let mut checkpoint = Checkpoint {
            id: params
                .id_override
                .unwrap_or_else(|| id::new_id(id::CHECKPOINT)),
            task_id: task.id.clone(),
            sequence: 0,
            trigger,
            task_status: task.status,
            task_notes: task.notes.clone(),
            task_metadata: task.metadata.clone(),
            blocked_reason: task.blocked_reason.clone(),
            assigned_agent: task.assigned_agent.clone(),
            execution_phase: params.execution_phase,
            execution_step: params.execution_step,
            agent_context,
            draft_content,
            draft_type: params.draft_type,
            subtask_states,
            iteration_config: params.iteration_config,
            iteration_number: params.iteration_number,
            iteration_history: vec![],
            validation_state: None,
            created_at: now,
            expires_at,
        };

        self.store.insert_checkpoint(&mut checkpoint).await?;

        self.events.emit(Event::CheckpointCreated {
            checkpoint_id: checkpoint.id.clone(),
            task_id: checkpoint.task_id.clone(),
            sequence: checkpoint.sequence,
        });

        let initiative = self.initiative_for_task(&task).await?;
        self.store
            .append_activity(
                &initiative,
                "checkpoint",
                &checkpoint.id,
                "checkpoint_created",
                &format!(
                    "Checkpoint {} for task '{}' ({trigger})",
                    checkpoint.sequence, task.title
                ),
                &Metadata::new(),
            )
            .await?;

        Ok(checkpoint)
    }

    pub async fn checkpoint_get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        self.store.get_checkpoint(checkpoint_id).await
    }

    pub async fn checkpoint_list(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        self.store.list_checkpoints(task_id).await
    }

    /// Reconstruct working state from a checkpoint. Returns `None` when no
    /// usable (present, unexpired) checkpoint exists.
    pub async fn checkpoint_resume(
        &self,
        params: CheckpointResumeParams,
    ) -> Result<Option<CheckpointResumeResponse>> {
        let checkpoint = match &params.checkpoint_id {
            Some(id) => self.store.get_checkpoint(id).await?,
            None => self.store.latest_checkpoint(&params.task_id).await?,
        };
        let Some(checkpoint) = checkpoint else {
            return Ok(None);
        };
        if checkpoint.is_expired(Utc::now()) {
            return Ok(None);
        }

        let task = self.store.get_task(&checkpoint.task_id).await?;

        let subtask_summary = summarize_subtasks(&checkpoint.subtask_states);
        let has_draft = checkpoint.draft_content.is_some();
        let draft_preview = checkpoint
            .draft_content
            .as_deref()
            .map(|draft| draft.chars().take(200).collect());

        let pause_metadata = checkpoint
            .agent_context
            .as_ref()
            .filter(|ctx| ctx.get("pauseReason").is_some())
            .map(|ctx| {
                json!({
                    "pauseReason": ctx.get("pauseReason"),
                    "pausedBy": ctx.get("pausedBy"),
                    "nextSteps": ctx.get("nextSteps"),
                    "blockers": ctx.get("blockers"),
                    "keyFiles": ctx.get("keyFiles"),
                    "estimatedResumeTime": ctx.get("estimatedResumeTime"),
                    "pausedAt": ctx.get("pausedAt"),
                })
            });

        let resume_instructions = build_resume_instructions(
            task.as_ref(),
            &checkpoint,
            has_draft,
            &subtask_summary,
        );

        self.events.emit(Event::CheckpointResumed {
            checkpoint_id: checkpoint.id.clone(),
            task_id: checkpoint.task_id.clone(),
        });

        let completion_promises = checkpoint
            .iteration_config
            .as_ref()
            .map(|c| c.completion_promises.clone());

        Ok(Some(CheckpointResumeResponse {
            checkpoint_id: checkpoint.id,
            task_id: checkpoint.task_id,
            sequence: checkpoint.sequence,
            restored_status: checkpoint.task_status,
            execution_phase: checkpoint.execution_phase,
            execution_step: checkpoint.execution_step,
            agent_context: checkpoint.agent_context,
            has_draft,
            draft_preview,
            draft_type: checkpoint.draft_type,
            subtask_summary,
            resume_instructions,
            created_at: checkpoint.created_at,
            iteration_config: checkpoint.iteration_config,
            iteration_number: checkpoint.iteration_number,
            iteration_history: checkpoint.iteration_history,
            completion_promises,
            validation_state: checkpoint.validation_state,
            pause_metadata,
        }))
    }

    /// Delete expired checkpoints, then aged ones, then enforce a per-task
    /// retention count. Idempotent.
    pub async fn checkpoint_cleanup(
        &self,
        params: CheckpointCleanupParams,
    ) -> Result<CheckpointCleanupResponse> {
        let now = Utc::now();
        let mut deleted = self.store.delete_expired_checkpoints(now).await?;

        if let Some(minutes) = params.older_than_minutes {
            let cutoff = now - Duration::minutes(minutes);
            deleted += self
                .store
                .delete_checkpoints_older_than(cutoff, params.task_id.as_deref())
                .await?;
        }

        if let (Some(task_id), Some(keep)) = (&params.task_id, params.keep_latest) {
            deleted += self.store.retain_latest_checkpoints(task_id, keep).await?;
        }

        let remaining = self
            .store
            .count_checkpoints(params.task_id.as_deref())
            .await?;

        Ok(CheckpointCleanupResponse { deleted, remaining })
    }
}

fn merge_pause_metadata(
    agent_context: Option<Value>,
    pause: Option<PauseMetadata>,
    now: DateTime<Utc>,
) -> Option<Value> {
    let Some(pause) = pause else {
        return agent_context;
    };
    let mut ctx = match agent_context {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("context".into(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    if let Some(reason) = pause.pause_reason {
        ctx.insert("pauseReason".into(), json!(reason));
    }
    if let Some(by) = pause.paused_by {
        ctx.insert("pausedBy".into(), json!(by));
    }
    if let Some(steps) = pause.next_steps {
        ctx.insert("nextSteps".into(), json!(steps));
    }
    if let Some(blockers) = pause.blockers {
        ctx.insert("blockers".into(), json!(blockers));
    }
    if let Some(files) = pause.key_files {
        ctx.insert("keyFiles".into(), json!(files));
    }
    if let Some(eta) = pause.estimated_resume_time {
        ctx.insert("estimatedResumeTime".into(), json!(eta));
    }
    ctx.insert("pausedAt".into(), json!(now));
    Some(Value::Object(ctx))
}

fn truncate_draft(draft: &str) -> String {
    if draft.len() <= DRAFT_LIMIT_BYTES {
        return draft.to_string();
    }
    let mut cut = DRAFT_LIMIT_BYTES;
    while cut > 0 && !draft.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &draft[..cut])
}

fn summarize_subtasks(states: &[SubtaskState]) -> SubtaskSummary {
    let count = |status: TaskStatus| states.iter().filter(|s| s.status == status).count();
    SubtaskSummary {
        total: states.len(),
        completed: count(TaskStatus::Completed),
        pending: count(TaskStatus::Pending),
        blocked: count(TaskStatus::Blocked),
    }
}

fn build_resume_instructions(
    task: Option<&Task>,
    checkpoint: &Checkpoint,
    has_draft: bool,
    subtasks: &SubtaskSummary,
) -> String {
    let mut lines = Vec::new();
    match task {
        Some(task) => lines.push(format!(
            "Resuming task '{}' (status at checkpoint: {})",
            task.title, checkpoint.task_status
        )),
        None => lines.push(format!(
            "Resuming task {} (status at checkpoint: {})",
            checkpoint.task_id, checkpoint.task_status
        )),
    }
    if let Some(ref phase) = checkpoint.execution_phase {
        lines.push(format!("Phase: {phase}"));
    }
    if let Some(ref step) = checkpoint.execution_step {
        lines.push(format!("Step: {step}"));
    }
    if let Some(ref reason) = checkpoint.blocked_reason {
        lines.push(format!("Blocked at checkpoint time: {reason}"));
    }
    if let Some(ref agent) = checkpoint.assigned_agent {
        lines.push(format!("Assigned agent: {agent}"));
    }
    if has_draft {
        lines.push("A draft is attached; review it before redoing work.".to_string());
    }
    if subtasks.total > 0 {
        lines.push(format!(
            "Subtasks: {} total, {} completed, {} pending, {} blocked",
            subtasks.total, subtasks.completed, subtasks.pending, subtasks.blocked
        ));
    }
    if checkpoint.is_iteration() {
        lines.push(format!(
            "An iteration loop is in flight (iteration {}); resume it with iteration_validate.",
            checkpoint.iteration_number.unwrap_or(1)
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_draft_marker() {
        let short = "small draft";
        assert_eq!(truncate_draft(short), short);

        let long = "x".repeat(DRAFT_LIMIT_BYTES + 1000);
        let truncated = truncate_draft(&long);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert!(truncated.len() <= DRAFT_LIMIT_BYTES + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_truncate_draft_respects_char_boundaries() {
        let long = "é".repeat(DRAFT_LIMIT_BYTES);
        let truncated = truncate_draft(&long);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_subtask_summary() {
        let states = vec![
            SubtaskState { id: "a".into(), status: TaskStatus::Completed },
            SubtaskState { id: "b".into(), status: TaskStatus::Pending },
            SubtaskState { id: "c".into(), status: TaskStatus::Blocked },
            SubtaskState { id: "d".into(), status: TaskStatus::Completed },
        ];
        let summary = summarize_subtasks(&states);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.blocked, 1);
    }

    #[test]
    fn test_merge_pause_metadata() {
        let merged = merge_pause_metadata(
            Some(json!({"scratch": 1})),
            Some(PauseMetadata {
                pause_reason: Some("waiting on review".into()),
                paused_by: Some("sd-agent".into()),
                next_steps: Some(vec!["rebase".into()]),
                blockers: None,
                key_files: None,
                estimated_resume_time: None,
            }),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(merged["scratch"], 1);
        assert_eq!(merged["pauseReason"], "waiting on review");
        assert_eq!(merged["pausedBy"], "sd-agent");
        assert!(merged.get("pausedAt").is_some());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rules::RuleSpec;

/// Opaque textual mapping carried by PRDs, tasks, checkpoints and
/// work-products. Serialized as a JSON object; consumers own disjoint keys.
pub type Metadata = serde_json::Map<String, Value>;

/// Root of a workspace scope. At most one initiative is "current" per
/// workspace; linking a different id demotes the previous one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Initiative {
    pub id: String,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// PRD classification derived from title + description when not supplied.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrdType {
    Feature,
    Experience,
    Defect,
    Question,
    Technical,
}

impl PrdType {
    /// Default scope lock for this PRD type.
    pub fn default_scope_locked(self) -> bool {
        matches!(self, PrdType::Feature | PrdType::Experience)
    }
}

impl std::fmt::Display for PrdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrdType::Feature => "FEATURE",
            PrdType::Experience => "EXPERIENCE",
            PrdType::Defect => "DEFECT",
            PrdType::Question => "QUESTION",
            PrdType::Technical => "TECHNICAL",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrdStatus {
    Active,
    Archived,
}

impl std::fmt::Display for PrdStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrdStatus::Active => write!(f, "active"),
            PrdStatus::Archived => write!(f, "archived"),
        }
    }
}

/// A milestone recorded inside PRD metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub task_ids: Vec<String>,
}

/// Product-requirement document owned by an initiative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    pub id: String,
    pub initiative_id: String,
    pub title: String,
    pub description: String,
    /// Opaque document body
    pub content: String,
    pub prd_type: PrdType,
    pub scope_locked: bool,
    pub status: PrdStatus,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prd {
    /// Milestones parsed from `metadata.milestones`, empty when absent.
    pub fn milestones(&self) -> Vec<Milestone> {
        self.metadata
            .get("milestones")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Task lifecycle states.
///
/// Transitions are free-form except for the completion gate: any transition
/// targeting `Completed` runs the quality-gate runner first, and a failing
/// gate set rewrites the transition to `Blocked`. `Completed -> Completed`
/// is an idempotent no-op.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::error::CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "blocked" => Ok(TaskStatus::Blocked),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(crate::error::CoordError::Validation(format!(
                "Invalid task status: '{other}'"
            ))),
        }
    }
}

/// Phase of a work stream; orders `stream_list` output.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    Foundation,
    Parallel,
    Integration,
}

impl StreamPhase {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "foundation" => Some(StreamPhase::Foundation),
            "parallel" => Some(StreamPhase::Parallel),
            "integration" => Some(StreamPhase::Integration),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamPhase::Foundation => write!(f, "foundation"),
            StreamPhase::Parallel => write!(f, "parallel"),
            StreamPhase::Integration => write!(f, "integration"),
        }
    }
}

/// Per-task hint about depth of analysis, auto-detected from title and
/// description keywords unless set explicitly.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    Ultrawork,
    Analyze,
    Quick,
    Thorough,
}

impl std::fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivationMode::Ultrawork => "ultrawork",
            ActivationMode::Analyze => "analyze",
            ActivationMode::Quick => "quick",
            ActivationMode::Thorough => "thorough",
        };
        write!(f, "{s}")
    }
}

/// Unit of work. Subtasks form a tree via `parent_id`; stream membership,
/// file lists and worktree isolation all live in `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub prd_id: Option<String>,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub assigned_agent: Option<String>,
    pub status: TaskStatus,
    pub blocked_reason: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub archived_by_initiative_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    fn meta_string_list(&self, key: &str) -> Vec<String> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.meta_str("streamId")
    }

    pub fn stream_name(&self) -> Option<&str> {
        self.meta_str("streamName")
    }

    pub fn stream_phase(&self) -> Option<StreamPhase> {
        self.meta_str("streamPhase").and_then(StreamPhase::parse)
    }

    pub fn stream_dependencies(&self) -> Vec<String> {
        self.meta_string_list("streamDependencies")
    }

    /// File paths this task touches, used by the conflict check.
    pub fn files(&self) -> Vec<String> {
        self.meta_string_list("files")
    }

    pub fn worktree_path(&self) -> Option<&str> {
        self.meta_str("worktreePath")
    }

    pub fn branch_name(&self) -> Option<&str> {
        self.meta_str("branchName")
    }

    /// Effective quality gates: `None` means fall back to the config's
    /// default gates, `Some(vec![])` explicitly disables them.
    pub fn quality_gates(&self) -> Option<Vec<String>> {
        self.metadata.get("qualityGates").map(|v| {
            v.as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    pub fn activation_mode(&self) -> Option<ActivationMode> {
        self.metadata
            .get("activationMode")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Data transfer object for creating tasks
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub prd_id: Option<String>,
    pub parent_id: Option<String>,
    pub assigned_agent: Option<String>,
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Data transfer object for updating tasks; only supplied fields change.
/// Metadata merges shallowly over the existing mapping.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub assigned_agent: Option<String>,
    pub status: Option<TaskStatus>,
    pub blocked_reason: Option<String>,
    pub notes: Option<String>,
    pub metadata: Option<Metadata>,
}

/// Filter criteria for task listing. Fields combine with AND logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    pub prd_id: Option<String>,
    pub parent_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkProductType {
    TechnicalDesign,
    Implementation,
    TestPlan,
    Documentation,
    Other,
}

impl std::fmt::Display for WorkProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkProductType::TechnicalDesign => "technical_design",
            WorkProductType::Implementation => "implementation",
            WorkProductType::TestPlan => "test_plan",
            WorkProductType::Documentation => "documentation",
            WorkProductType::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Immutable deliverable attached to a task; append-only per task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkProduct {
    pub id: String,
    pub task_id: String,
    #[serde(rename = "type")]
    pub product_type: WorkProductType,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// What created a checkpoint.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    Manual,
    AutoStatus,
    AutoIteration,
}

impl std::fmt::Display for CheckpointTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointTrigger::Manual => "manual",
            CheckpointTrigger::AutoStatus => "auto_status",
            CheckpointTrigger::AutoIteration => "auto_iteration",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of a subtask taken when checkpointing the parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskState {
    pub id: String,
    pub status: TaskStatus,
}

/// Configuration of a bounded iteration loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IterationConfig {
    pub max_iterations: u32,
    pub completion_promises: Vec<String>,
    #[serde(default)]
    pub validation_rules: Vec<RuleSpec>,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
}

fn default_circuit_breaker_threshold() -> u32 {
    3
}

/// One completed iteration recorded in the loop history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IterationHistoryEntry {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    /// Whether that iteration's validation passed, when one was run
    pub validation_passed: Option<bool>,
    pub checkpoint_id: Option<String>,
}

/// Ordered recoverable snapshot scoped to a task. Checkpoints carrying an
/// iteration config represent a live iteration loop and never expire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    /// Monotonic per task, 1-based; gaps appear after pruning
    pub sequence: i64,
    pub trigger: CheckpointTrigger,
    pub task_status: TaskStatus,
    pub task_notes: Option<String>,
    pub task_metadata: Metadata,
    pub blocked_reason: Option<String>,
    pub assigned_agent: Option<String>,
    pub execution_phase: Option<String>,
    pub execution_step: Option<String>,
    pub agent_context: Option<Value>,
    pub draft_content: Option<String>,
    pub draft_type: Option<String>,
    #[serde(default)]
    pub subtask_states: Vec<SubtaskState>,
    pub iteration_config: Option<IterationConfig>,
    pub iteration_number: Option<u32>,
    #[serde(default)]
    pub iteration_history: Vec<IterationHistoryEntry>,
    pub validation_state: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// An iteration checkpoint is distinguished by a non-null config.
    pub fn is_iteration(&self) -> bool {
        self.iteration_config.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at < now).unwrap_or(false)
    }
}

/// Record of agent-to-agent work transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    pub id: String,
    pub task_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub work_product_id: String,
    /// At most 50 characters, enforced at creation
    pub handoff_context: String,
    pub chain_position: u32,
    pub chain_length: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScopeChangeType {
    AddTask,
    ModifyTask,
    RemoveTask,
}

impl std::fmt::Display for ScopeChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScopeChangeType::AddTask => "add_task",
            ScopeChangeType::ModifyTask => "modify_task",
            ScopeChangeType::RemoveTask => "remove_task",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScopeChangeStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ScopeChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeChangeStatus::Pending => write!(f, "pending"),
            ScopeChangeStatus::Approved => write!(f, "approved"),
            ScopeChangeStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Request to alter the task set of a scope-locked PRD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScopeChange {
    pub id: String,
    pub prd_id: String,
    pub request_type: ScopeChangeType,
    pub description: String,
    pub rationale: String,
    pub requested_by: String,
    pub status: ScopeChangeStatus,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub review_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit entry keyed by initiative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: i64,
    pub initiative_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub summary: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Outcome recorded when a task reaches a terminal state or is reassigned.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceOutcome {
    Success,
    Failure,
    Blocked,
    Reassigned,
}

impl std::fmt::Display for PerformanceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PerformanceOutcome::Success => "success",
            PerformanceOutcome::Failure => "failure",
            PerformanceOutcome::Blocked => "blocked",
            PerformanceOutcome::Reassigned => "reassigned",
        };
        write!(f, "{s}")
    }
}

/// Per-agent outcome log row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceRecord {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    pub work_product_type: Option<WorkProductType>,
    pub complexity: Option<String>,
    pub outcome: PerformanceOutcome,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Session-scoped audit of a main-session guardrail breach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolViolation {
    pub id: String,
    pub session_id: String,
    pub initiative_id: Option<String>,
    pub violation_type: String,
    pub severity: Severity,
    pub context: Option<Value>,
    pub suggestion: Option<String>,
    pub created_at: DateTime<Utc>,
}

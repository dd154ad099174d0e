use chrono::{DateTime, Utc};
use coord_core::{
    error::{CoordError, Result},
    models::{
        ActivityEntry, Checkpoint, CheckpointTrigger, Handoff, Initiative, Metadata,
        PerformanceOutcome, PerformanceRecord, Prd, PrdStatus, PrdType, ProtocolViolation,
        ScopeChange, ScopeChangeStatus, ScopeChangeType, Severity, Task, TaskStatus, WorkProduct,
        WorkProductType,
    },
};
use sqlx::{sqlite::SqliteRow, Row};

pub fn status_to_string(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Cancelled => "cancelled",
    }
}

pub fn string_to_status(s: &str) -> Result<TaskStatus> {
    s.parse()
        .map_err(|_| CoordError::Store(format!("Invalid task status in store: {s}")))
}

pub fn trigger_to_string(trigger: CheckpointTrigger) -> &'static str {
    match trigger {
        CheckpointTrigger::Manual => "manual",
        CheckpointTrigger::AutoStatus => "auto_status",
        CheckpointTrigger::AutoIteration => "auto_iteration",
    }
}

pub fn string_to_trigger(s: &str) -> Result<CheckpointTrigger> {
    match s {
        "manual" => Ok(CheckpointTrigger::Manual),
        "auto_status" => Ok(CheckpointTrigger::AutoStatus),
        "auto_iteration" => Ok(CheckpointTrigger::AutoIteration),
        _ => Err(CoordError::Store(format!(
            "Invalid checkpoint trigger in store: {s}"
        ))),
    }
}

fn enum_from_json<T: serde::de::DeserializeOwned>(label: &str, s: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| CoordError::Store(format!("Invalid {label} in store: {s}")))
}

pub fn enum_to_json_string<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

pub fn parse_metadata(raw: &str) -> Metadata {
    serde_json::from_str(raw).unwrap_or_default()
}

fn parse_json_column<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

pub fn row_to_initiative(row: &SqliteRow) -> Result<Initiative> {
    Ok(Initiative {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub fn row_to_prd(row: &SqliteRow) -> Result<Prd> {
    let prd_type: String = row.get("prd_type");
    let status: String = row.get("status");
    let metadata: String = row.get("metadata");
    Ok(Prd {
        id: row.get("id"),
        initiative_id: row.get("initiative_id"),
        title: row.get("title"),
        description: row.get("description"),
        content: row.get("content"),
        prd_type: enum_from_json::<PrdType>("prd type", &prd_type)?,
        scope_locked: row.get::<i64, _>("scope_locked") != 0,
        status: enum_from_json::<PrdStatus>("prd status", &status)?,
        metadata: parse_metadata(&metadata),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("status");
    let metadata: String = row.get("metadata");
    Ok(Task {
        id: row.get("id"),
        prd_id: row.get("prd_id"),
        parent_id: row.get("parent_id"),
        title: row.get("title"),
        description: row.get("description"),
        assigned_agent: row.get("assigned_agent"),
        status: string_to_status(&status)?,
        blocked_reason: row.get("blocked_reason"),
        notes: row.get("notes"),
        metadata: parse_metadata(&metadata),
        archived: row.get::<i64, _>("archived") != 0,
        archived_at: row.get("archived_at"),
        archived_by_initiative_id: row.get("archived_by_initiative_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub fn row_to_work_product(row: &SqliteRow) -> Result<WorkProduct> {
    let product_type: String = row.get("product_type");
    let metadata: String = row.get("metadata");
    Ok(WorkProduct {
        id: row.get("id"),
        task_id: row.get("task_id"),
        product_type: enum_from_json::<WorkProductType>("work product type", &product_type)?,
        title: row.get("title"),
        content: row.get("content"),
        metadata: parse_metadata(&metadata),
        created_at: row.get("created_at"),
    })
}

pub fn row_to_checkpoint(row: &SqliteRow) -> Result<Checkpoint> {
    let trigger: String = row.get("trigger_kind");
    let task_status: String = row.get("task_status");
    let task_metadata: String = row.get("task_metadata");
    let agent_context: Option<String> = row.get("agent_context");
    let validation_state: Option<String> = row.get("validation_state");
    let iteration_config: Option<String> = row.get("iteration_config");
    let iteration_number: Option<i64> = row.get("iteration_number");

    Ok(Checkpoint {
        id: row.get("id"),
        task_id: row.get("task_id"),
        sequence: row.get("sequence"),
        trigger: string_to_trigger(&trigger)?,
        task_status: string_to_status(&task_status)?,
        task_notes: row.get("task_notes"),
        task_metadata: parse_metadata(&task_metadata),
        blocked_reason: row.get("blocked_reason"),
        assigned_agent: row.get("assigned_agent"),
        execution_phase: row.get("execution_phase"),
        execution_step: row.get("execution_step"),
        agent_context: agent_context.and_then(|s| serde_json::from_str(&s).ok()),
        draft_content: row.get("draft_content"),
        draft_type: row.get("draft_type"),
        subtask_states: parse_json_column(row.get("subtask_states")),
        iteration_config: iteration_config.and_then(|s| serde_json::from_str(&s).ok()),
        iteration_number: iteration_number.map(|n| n as u32),
        iteration_history: parse_json_column(row.get("iteration_history")),
        validation_state: validation_state.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    })
}

pub fn row_to_handoff(row: &SqliteRow) -> Result<Handoff> {
    Ok(Handoff {
        id: row.get("id"),
        task_id: row.get("task_id"),
        from_agent: row.get("from_agent"),
        to_agent: row.get("to_agent"),
        work_product_id: row.get("work_product_id"),
        handoff_context: row.get("handoff_context"),
        chain_position: row.get::<i64, _>("chain_position") as u32,
        chain_length: row.get::<i64, _>("chain_length") as u32,
        created_at: row.get("created_at"),
    })
}

pub fn row_to_scope_change(row: &SqliteRow) -> Result<ScopeChange> {
    let request_type: String = row.get("request_type");
    let status: String = row.get("status");
    Ok(ScopeChange {
        id: row.get("id"),
        prd_id: row.get("prd_id"),
        request_type: enum_from_json::<ScopeChangeType>("scope change type", &request_type)?,
        description: row.get("description"),
        rationale: row.get("rationale"),
        requested_by: row.get("requested_by"),
        status: enum_from_json::<ScopeChangeStatus>("scope change status", &status)?,
        reviewed_at: row.get("reviewed_at"),
        reviewed_by: row.get("reviewed_by"),
        review_notes: row.get("review_notes"),
        created_at: row.get("created_at"),
    })
}

pub fn row_to_activity(row: &SqliteRow) -> Result<ActivityEntry> {
    let metadata: String = row.get("metadata");
    Ok(ActivityEntry {
        id: row.get("id"),
        initiative_id: row.get("initiative_id"),
        entity_type: row.get("entity_type"),
        entity_id: row.get("entity_id"),
        action: row.get("action"),
        summary: row.get("summary"),
        metadata: parse_metadata(&metadata),
        created_at: row.get("created_at"),
    })
}

pub fn row_to_performance(row: &SqliteRow) -> Result<PerformanceRecord> {
    let outcome: String = row.get("outcome");
    let work_product_type: Option<String> = row.get("work_product_type");
    Ok(PerformanceRecord {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        task_id: row.get("task_id"),
        work_product_type: work_product_type
            .map(|s| enum_from_json::<WorkProductType>("work product type", &s))
            .transpose()?,
        complexity: row.get("complexity"),
        outcome: enum_from_json::<PerformanceOutcome>("performance outcome", &outcome)?,
        duration_ms: row.get("duration_ms"),
        created_at: row.get("created_at"),
    })
}

pub fn row_to_violation(row: &SqliteRow) -> Result<ProtocolViolation> {
    let severity: String = row.get("severity");
    let context: Option<String> = row.get("context");
    Ok(ProtocolViolation {
        id: row.get("id"),
        session_id: row.get("session_id"),
        initiative_id: row.get("initiative_id"),
        violation_type: row.get("violation_type"),
        severity: enum_from_json::<Severity>("severity", &severity)?,
        context: context.and_then(|s| serde_json::from_str(&s).ok()),
        suggestion: row.get("suggestion"),
        created_at: row.get("created_at"),
    })
}

pub fn sqlx_error_to_coord_error(err: sqlx::Error) -> CoordError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            if message.contains("UNIQUE constraint failed") {
                CoordError::Store(format!("Unique constraint violated: {message}"))
            } else if message.contains("FOREIGN KEY constraint failed") {
                CoordError::Store(format!("Foreign key constraint violated: {message}"))
            } else {
                CoordError::Store(format!("Database constraint error: {message}"))
            }
        }
        sqlx::Error::RowNotFound => CoordError::Store("Unexpected missing row".to_string()),
        sqlx::Error::PoolTimedOut => CoordError::Store("Connection pool timeout".to_string()),
        sqlx::Error::Io(io_err) => CoordError::Store(format!("Database I/O error: {io_err}")),
        _ => CoordError::Store(format!("Database operation failed: {err}")),
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

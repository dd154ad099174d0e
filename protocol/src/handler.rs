//! Tool dispatch: canonical tool names to Coordinator operations.
//!
//! Each tool takes a single JSON object and returns a single JSON value;
//! plain gets return `null` when nothing is found.

use std::sync::Arc;

use coord_core::models::{NewTask, TaskFilter};
use coord_core::security::{SecurityRule, ToolUse};
use engine::checkpoints::{
    CheckpointCleanupParams, CheckpointCreateParams, CheckpointResumeParams,
};
use engine::entity::{
    AgentHandoffParams, InitiativeArchiveParams, InitiativeLinkParams, InitiativeWipeParams,
    PrdCreateParams, ScopeChangeListParams, ScopeChangeRequestParams, ScopeChangeReviewParams,
    ViolationLogParams, ViolationsGetParams,
};
use engine::iteration::{
    IterationCompleteParams, IterationNextParams, IterationStartParams, IterationValidateParams,
};
use engine::preflight::PreflightParams;
use engine::streams::{
    StreamArchiveAllParams, StreamConflictParams, StreamGetParams, StreamListParams,
    StreamUnarchiveParams,
};
use engine::task_tools::{TaskGetParams, TaskUpdateParams, WorkProductStoreParams};
use engine::Coordinator;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::RpcError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrdGetParams {
    prd_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PrdListParams {
    initiative_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkProductGetParams {
    work_product_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskScopedParams {
    task_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointGetParams {
    checkpoint_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentScopedParams {
    agent_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ProgressParams {
    initiative_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HookToggleParams {
    rule_id: String,
    enabled: bool,
}

/// The content-addressed tool surface over one Coordinator.
#[derive(Clone)]
pub struct ToolHandler {
    coordinator: Arc<Coordinator>,
}

impl ToolHandler {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    fn parse<T: serde::de::DeserializeOwned>(tool: &str, params: Value) -> Result<T, RpcError> {
        serde_json::from_value(params)
            .map_err(|e| RpcError::Validation(format!("Invalid {tool} parameters: {e}")))
    }

    fn ok<T: serde::Serialize>(value: T) -> Result<Value, RpcError> {
        Ok(serde_json::to_value(value)?)
    }

    fn ok_opt<T: serde::Serialize>(value: Option<T>) -> Result<Value, RpcError> {
        match value {
            Some(value) => Ok(serde_json::to_value(value)?),
            None => Ok(Value::Null),
        }
    }

    /// Dispatch a tool call by canonical name.
    pub async fn dispatch(&self, tool: &str, params: Value) -> Result<Value, RpcError> {
        let c = &self.coordinator;
        match tool {
            // Entity tools
            "initiative_link" => {
                let params: InitiativeLinkParams = Self::parse(tool, params)?;
                Self::ok(c.initiative_link(params).await?)
            }
            "initiative_archive" => {
                let params: InitiativeArchiveParams = Self::parse(tool, params)?;
                Self::ok(c.initiative_archive(params).await?)
            }
            "initiative_wipe" => {
                let params: InitiativeWipeParams = Self::parse(tool, params)?;
                Self::ok(c.initiative_wipe(params).await?)
            }
            "prd_create" => {
                let params: PrdCreateParams = Self::parse(tool, params)?;
                Self::ok(c.prd_create(params).await?)
            }
            "prd_get" => {
                let params: PrdGetParams = Self::parse(tool, params)?;
                Self::ok_opt(c.prd_get(&params.prd_id).await?)
            }
            "prd_list" => {
                let params: PrdListParams = Self::parse(tool, params)?;
                Self::ok(c.prd_list(params.initiative_id).await?)
            }
            "task_create" => {
                let params: NewTask = Self::parse(tool, params)?;
                Self::ok(c.task_create(params).await?)
            }
            "task_update" => {
                let params: TaskUpdateParams = Self::parse(tool, params)?;
                Self::ok(c.task_update(params).await?)
            }
            "task_get" => {
                let params: TaskGetParams = Self::parse(tool, params)?;
                Self::ok_opt(c.task_get(params).await?)
            }
            "task_list" => {
                let params: TaskFilter = Self::parse(tool, params)?;
                Self::ok(c.task_list(params).await?)
            }
            "work_product_store" => {
                let params: WorkProductStoreParams = Self::parse(tool, params)?;
                Self::ok(c.work_product_store(params).await?)
            }
            "work_product_get" => {
                let params: WorkProductGetParams = Self::parse(tool, params)?;
                Self::ok_opt(c.work_product_get(&params.work_product_id).await?)
            }
            "work_product_list" => {
                let params: TaskScopedParams = Self::parse(tool, params)?;
                Self::ok(c.work_product_list(&params.task_id).await?)
            }
            "scope_change_request" => {
                let params: ScopeChangeRequestParams = Self::parse(tool, params)?;
                Self::ok(c.scope_change_request(params).await?)
            }
            "scope_change_review" => {
                let params: ScopeChangeReviewParams = Self::parse(tool, params)?;
                Self::ok(c.scope_change_review(params).await?)
            }
            "scope_change_list" => {
                let params: ScopeChangeListParams = Self::parse(tool, params)?;
                Self::ok(c.scope_change_list(params).await?)
            }
            "agent_handoff" => {
                let params: AgentHandoffParams = Self::parse(tool, params)?;
                Self::ok(c.agent_handoff(params).await?)
            }
            "agent_chain_get" => {
                let params: TaskScopedParams = Self::parse(tool, params)?;
                Self::ok_opt(c.agent_chain_get(&params.task_id).await?)
            }
            "agent_performance_get" => {
                let params: AgentScopedParams = Self::parse(tool, params)?;
                Self::ok(c.agent_performance_get(&params.agent_id).await?)
            }
            "progress_summary" => {
                let params: ProgressParams = Self::parse(tool, params)?;
                Self::ok(c.progress_summary(params.initiative_id).await?)
            }

            // Checkpoint tools
            "checkpoint_create" => {
                let params: CheckpointCreateParams = Self::parse(tool, params)?;
                Self::ok(c.checkpoint_create(params).await?)
            }
            "checkpoint_get" => {
                let params: CheckpointGetParams = Self::parse(tool, params)?;
                Self::ok_opt(c.checkpoint_get(&params.checkpoint_id).await?)
            }
            "checkpoint_list" => {
                let params: TaskScopedParams = Self::parse(tool, params)?;
                Self::ok(c.checkpoint_list(&params.task_id).await?)
            }
            "checkpoint_resume" => {
                let params: CheckpointResumeParams = Self::parse(tool, params)?;
                Self::ok_opt(c.checkpoint_resume(params).await?)
            }
            "checkpoint_cleanup" => {
                let params: CheckpointCleanupParams = Self::parse(tool, params)?;
                Self::ok(c.checkpoint_cleanup(params).await?)
            }

            // Iteration tools
            "iteration_start" => {
                let params: IterationStartParams = Self::parse(tool, params)?;
                Self::ok(c.iteration_start(params).await?)
            }
            "iteration_validate" => {
                let params: IterationValidateParams = Self::parse(tool, params)?;
                Self::ok(c.iteration_validate(params).await?)
            }
            "iteration_next" => {
                let params: IterationNextParams = Self::parse(tool, params)?;
                Self::ok(c.iteration_next(params).await?)
            }
            "iteration_complete" => {
                let params: IterationCompleteParams = Self::parse(tool, params)?;
                Self::ok(c.iteration_complete(params).await?)
            }

            // Stream tools
            "stream_list" => {
                let params: StreamListParams = Self::parse(tool, params)?;
                Self::ok(c.stream_list(params).await?)
            }
            "stream_get" => {
                let params: StreamGetParams = Self::parse(tool, params)?;
                Self::ok_opt(c.stream_get(params).await?)
            }
            "stream_conflict_check" => {
                let params: StreamConflictParams = Self::parse(tool, params)?;
                Self::ok(c.stream_conflict_check(params).await?)
            }
            "stream_archive_all" => {
                let params: StreamArchiveAllParams = Self::parse(tool, params)?;
                Self::ok(c.stream_archive_all(params).await?)
            }
            "stream_unarchive" => {
                let params: StreamUnarchiveParams = Self::parse(tool, params)?;
                Self::ok(c.stream_unarchive(params).await?)
            }

            // Security hook pipeline
            "hook_register_security" => {
                let rule: SecurityRule = Self::parse(tool, params)?;
                c.security().register(rule).map_err(RpcError::from)?;
                Ok(json!({ "registered": true }))
            }
            "hook_list_security" => Self::ok(c.security().list()),
            "hook_test_security" => {
                let tool_use: ToolUse = Self::parse(tool, params)?;
                Self::ok(c.security().test(&tool_use))
            }
            "hook_toggle_security" => {
                let params: HookToggleParams = Self::parse(tool, params)?;
                let enabled = c
                    .security()
                    .toggle(&params.rule_id, params.enabled)
                    .map_err(RpcError::from)?;
                Ok(json!({ "ruleId": params.rule_id, "enabled": enabled }))
            }

            // Preflight & audit
            "preflight_check" => {
                let params: PreflightParams = Self::parse(tool, params)?;
                Self::ok(c.preflight_check(params).await?)
            }
            "protocol_violation_log" => {
                let params: ViolationLogParams = Self::parse(tool, params)?;
                Self::ok(c.protocol_violation_log(params).await?)
            }
            "protocol_violations_get" => {
                let params: ViolationsGetParams = Self::parse(tool, params)?;
                Self::ok(c.protocol_violations_get(params).await?)
            }

            other => Err(RpcError::Protocol(format!("Unknown tool: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use database::CoordStore;
    use engine::CoordinatorOptions;

    async fn handler() -> (ToolHandler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CoordStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let options = CoordinatorOptions {
            project_root: dir.path().to_path_buf(),
            store_dir: dir.path().join(".coord"),
            auto_checkpoint: true,
            security_enabled: true,
        };
        (
            ToolHandler::new(Arc::new(Coordinator::new(Arc::new(store), options))),
            dir,
        )
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (handler, _dir) = handler().await;
        let err = handler.dispatch("no_such_tool", json!({})).await.unwrap_err();
        assert_eq!(err.to_error_code(), -32006);
    }

    #[tokio::test]
    async fn test_get_returns_null_for_missing() {
        let (handler, _dir) = handler().await;
        let result = handler
            .dispatch("task_get", json!({ "taskId": "TASK-missing" }))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);

        let result = handler
            .dispatch("prd_get", json!({ "prdId": "PRD-missing" }))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_create_flow_through_dispatch() {
        let (handler, _dir) = handler().await;
        handler
            .dispatch("initiative_link", json!({ "initiativeId": "INIT-001" }))
            .await
            .unwrap();
        let prd = handler
            .dispatch("prd_create", json!({ "title": "Add retries" }))
            .await
            .unwrap();
        assert_eq!(prd["prdType"], "FEATURE");
        assert_eq!(prd["scopeLocked"], true);

        let task = handler
            .dispatch(
                "task_create",
                json!({ "title": "Do a thorough pass", "prdId": prd["id"] }),
            )
            .await
            .unwrap();
        assert_eq!(task["metadata"]["activationMode"], "thorough");

        let listed = handler.dispatch("task_list", json!({})).await.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_params_are_validation_errors() {
        let (handler, _dir) = handler().await;
        let err = handler
            .dispatch("task_update", json!({ "bogus": true }))
            .await
            .unwrap_err();
        assert_eq!(err.to_error_code(), -32002);
    }

    #[tokio::test]
    async fn test_security_tools() {
        let (handler, _dir) = handler().await;
        let decision = handler
            .dispatch(
                "hook_test_security",
                json!({ "toolName": "bash", "toolInput": { "command": "rm -rf / " } }),
            )
            .await
            .unwrap();
        assert_eq!(decision["allowed"], false);
        assert_eq!(decision["action"], "BLOCK");
        assert!(decision["executionTimeMs"].is_number());

        let rules = handler.dispatch("hook_list_security", json!({})).await.unwrap();
        assert!(rules.as_array().unwrap().len() >= 2);

        let toggled = handler
            .dispatch(
                "hook_toggle_security",
                json!({ "ruleId": "destructive-commands", "enabled": false }),
            )
            .await
            .unwrap();
        assert_eq!(toggled["enabled"], false);
    }
}

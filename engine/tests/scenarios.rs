//! End-to-end scenarios driven through the Coordinator against an
//! in-memory store.

use std::sync::Arc;

use coord_core::models::{
    Metadata, NewTask, TaskFilter, TaskStatus, UpdateTask, WorkProductType,
};
use coord_core::promise::CompletionSignal;
use database::CoordStore;
use engine::checkpoints::{CheckpointCleanupParams, CheckpointCreateParams, CheckpointResumeParams};
use engine::entity::{AgentHandoffParams, InitiativeLinkParams, PrdCreateParams};
use engine::iteration::{
    IterationCompleteParams, IterationNextParams, IterationStartParams, IterationValidateParams,
};
use engine::streams::{
    StreamConflictParams, StreamGetParams, StreamListParams, StreamUnarchiveParams,
};
use engine::task_tools::{TaskUpdateParams, WorkProductStoreParams};
use engine::{Coordinator, CoordinatorOptions};
use serde_json::json;

async fn coordinator() -> (Coordinator, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = CoordStore::in_memory().await.unwrap();
    store.migrate().await.unwrap();
    let options = CoordinatorOptions {
        project_root: dir.path().to_path_buf(),
        store_dir: dir.path().join(".coord"),
        auto_checkpoint: true,
        security_enabled: true,
    };
    (Coordinator::new(Arc::new(store), options), dir)
}

async fn link_initiative(coord: &Coordinator, id: &str) {
    coord
        .initiative_link(InitiativeLinkParams {
            initiative_id: id.to_string(),
            title: Some(format!("Initiative {id}")),
            description: String::new(),
        })
        .await
        .unwrap();
}

async fn create_prd(coord: &Coordinator) -> String {
    coord
        .prd_create(PrdCreateParams {
            initiative_id: None,
            title: "Implement coordination features".into(),
            description: String::new(),
            content: String::new(),
            prd_type: None,
            scope_locked: None,
            metadata: Metadata::new(),
        })
        .await
        .unwrap()
        .id
}

fn stream_task(prd_id: &str, title: &str, stream: &str, deps: &[&str]) -> NewTask {
    let mut metadata = Metadata::new();
    metadata.insert("streamId".into(), json!(stream));
    metadata.insert("streamName".into(), json!(format!("{stream} work")));
    metadata.insert("streamPhase".into(), json!("parallel"));
    if !deps.is_empty() {
        metadata.insert("streamDependencies".into(), json!(deps));
    }
    NewTask {
        title: title.into(),
        prd_id: Some(prd_id.into()),
        metadata,
        ..Default::default()
    }
}

#[tokio::test]
async fn stream_dependency_cycle_is_rejected() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;

    coord
        .task_create(stream_task(&prd, "A work", "Stream-A", &[]))
        .await
        .unwrap();
    coord
        .task_create(stream_task(&prd, "B work", "Stream-B", &["Stream-A"]))
        .await
        .unwrap();

    // Closing the loop back onto Stream-A creates A -> B -> A
    let err = coord
        .task_create(stream_task(&prd, "cycle", "Stream-A", &["Stream-B"]))
        .await
        .unwrap_err();
    assert!(err.is_cycle());
    assert!(format!("{err}").contains("Circular dependency detected"));
}

#[tokio::test]
async fn initiative_switch_auto_archives_streams() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;

    coord.task_create(stream_task(&prd, "T1", "Stream-A", &[])).await.unwrap();
    coord.task_create(stream_task(&prd, "T2", "Stream-A", &[])).await.unwrap();
    coord.task_create(stream_task(&prd, "T3", "Stream-B", &[])).await.unwrap();

    let response = coord
        .initiative_link(InitiativeLinkParams {
            initiative_id: "INIT-002".into(),
            title: None,
            description: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(response.archived_tasks, 3);
    assert_eq!(response.previous_initiative_id.as_deref(), Some("INIT-001"));

    let visible = coord
        .stream_list(StreamListParams {
            initiative_id: Some("INIT-001".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(visible.is_empty());

    let archived = coord
        .stream_list(StreamListParams {
            initiative_id: Some("INIT-001".into()),
            include_archived: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<&str> = archived.iter().map(|s| s.stream_id.as_str()).collect();
    assert_eq!(ids, vec!["Stream-A", "Stream-B"]);

    for summary in &archived {
        assert!(summary.archived);
    }
    let tasks = coord
        .store()
        .list_tasks(&TaskFilter {
            include_archived: true,
            ..Default::default()
        })
        .await
        .unwrap();
    for task in tasks.iter().filter(|t| t.archived) {
        assert_eq!(task.archived_by_initiative_id.as_deref(), Some("INIT-001"));
    }
}

#[tokio::test]
async fn archived_task_mutation_fails() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(stream_task(&prd, "T1", "Stream-A", &[]))
        .await
        .unwrap();
    link_initiative(&coord, "INIT-002").await;

    let err = coord
        .task_update(TaskUpdateParams {
            task_id: task.id,
            update: UpdateTask {
                notes: Some("still working".into()),
                ..Default::default()
            },
        })
        .await
        .unwrap_err();
    match err {
        coord_core::CoordError::ArchivedTask {
            stream, archived_by, ..
        } => {
            assert_eq!(stream, "Stream-A");
            assert_eq!(archived_by, "INIT-001");
        }
        other => panic!("expected ArchivedTask error, got {other:?}"),
    }
}

#[tokio::test]
async fn iteration_happy_path_completes_task() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Iterate on the fix".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();

    let started = coord
        .iteration_start(IterationStartParams {
            task_id: task.id.clone(),
            max_iterations: 3,
            completion_promises: vec!["<promise>COMPLETE</promise>".into()],
            validation_rules: vec![],
            circuit_breaker_threshold: None,
        })
        .await
        .unwrap();
    assert!(started.iteration_id.starts_with("IT-"));
    assert_eq!(started.iteration_number, 1);

    let first = coord
        .iteration_validate(IterationValidateParams {
            iteration_id: started.iteration_id.clone(),
            agent_output: Some("working".into()),
        })
        .await
        .unwrap();
    assert_eq!(first.completion_signal, CompletionSignal::Continue);
    assert!(first.detected_promise.is_none());

    coord
        .iteration_next(IterationNextParams {
            iteration_id: started.iteration_id.clone(),
            validation_result: Some(true),
            agent_context: None,
        })
        .await
        .unwrap();

    let second = coord
        .iteration_validate(IterationValidateParams {
            iteration_id: started.iteration_id.clone(),
            agent_output: Some("done <promise>COMPLETE</promise>".into()),
        })
        .await
        .unwrap();
    assert_eq!(second.completion_signal, CompletionSignal::Complete);
    assert!(second
        .detected_promise
        .unwrap()
        .starts_with("<promise>COMPLETE</promise>"));
    assert_eq!(
        second.completion_promises_detected,
        vec!["<promise>COMPLETE</promise>".to_string()]
    );

    let completed = coord
        .iteration_complete(IterationCompleteParams {
            iteration_id: started.iteration_id,
            completion_promise: "<promise>COMPLETE</promise>".into(),
            work_product_id: None,
        })
        .await
        .unwrap();
    assert_eq!(completed.status, TaskStatus::Completed);

    let task = coord.store().get_task(&completed.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task
        .notes
        .unwrap()
        .contains("Iteration completed: <promise>COMPLETE</promise>"));
    assert!(task.metadata.get("iterationComplete").is_some());
}

#[tokio::test]
async fn iteration_rejects_unknown_promise() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Iterate".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();
    let started = coord
        .iteration_start(IterationStartParams {
            task_id: task.id,
            max_iterations: 2,
            completion_promises: vec!["<promise>COMPLETE</promise>".into()],
            validation_rules: vec![],
            circuit_breaker_threshold: None,
        })
        .await
        .unwrap();

    let err = coord
        .iteration_complete(IterationCompleteParams {
            iteration_id: started.iteration_id,
            completion_promise: "something else".into(),
            work_product_id: None,
        })
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn iteration_escalates_at_max() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Bounded".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();
    let started = coord
        .iteration_start(IterationStartParams {
            task_id: task.id,
            max_iterations: 1,
            completion_promises: vec!["<promise>COMPLETE</promise>".into()],
            validation_rules: vec![],
            circuit_breaker_threshold: None,
        })
        .await
        .unwrap();

    let result = coord
        .iteration_validate(IterationValidateParams {
            iteration_id: started.iteration_id.clone(),
            agent_output: Some("no promise yet".into()),
        })
        .await
        .unwrap();
    assert_eq!(result.completion_signal, CompletionSignal::Escalate);

    // Advancing past the ceiling is rejected
    let err = coord
        .iteration_next(IterationNextParams {
            iteration_id: started.iteration_id,
            validation_result: Some(false),
            agent_context: None,
        })
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn blocked_tag_outranks_complete_tag() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Priorities".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();
    let started = coord
        .iteration_start(IterationStartParams {
            task_id: task.id,
            max_iterations: 3,
            completion_promises: vec!["<promise>COMPLETE</promise>".into()],
            validation_rules: vec![],
            circuit_breaker_threshold: None,
        })
        .await
        .unwrap();

    let result = coord
        .iteration_validate(IterationValidateParams {
            iteration_id: started.iteration_id,
            agent_output: Some(
                "<promise>COMPLETE</promise>\nwait, actually <promise>BLOCKED</promise> missing creds"
                    .into(),
            ),
        })
        .await
        .unwrap();
    assert_eq!(result.completion_signal, CompletionSignal::Blocked);
    assert!(result.detected_promise.unwrap().contains("BLOCKED"));
}

#[tokio::test]
async fn quality_gate_failure_rewrites_completion_to_blocked() {
    let (coord, dir) = coordinator().await;
    let claude_dir = dir.path().join(".claude");
    std::fs::create_dir_all(&claude_dir).unwrap();
    std::fs::write(
        claude_dir.join("quality-gates.json"),
        r#"{"version":"1.0","defaultGates":["tests_pass"],
            "gates":{"tests_pass":{"command":"exit 1"}}}"#,
    )
    .unwrap();

    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Gated".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();

    let response = coord
        .task_update(TaskUpdateParams {
            task_id: task.id,
            update: UpdateTask {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    assert_eq!(response.task.status, TaskStatus::Blocked);
    let reason = response.task.blocked_reason.unwrap();
    assert!(reason.contains("Quality gates failed: tests_pass"));
    assert!(reason.contains("1 of 1 gates failed"));
    assert!(response.task.notes.unwrap().contains("tests_pass"));
    assert!(!response.gate_report.unwrap().all_passed);
}

#[tokio::test]
async fn completed_to_completed_is_noop() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Done twice".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();

    for _ in 0..2 {
        let response = coord
            .task_update(TaskUpdateParams {
                task_id: task.id.clone(),
                update: UpdateTask {
                    status: Some(TaskStatus::Completed),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(response.task.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn checkpoint_pruning_keeps_five_newest() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Snapshots".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..7 {
        let cp = coord
            .checkpoint_create(CheckpointCreateParams {
                task_id: task.id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        ids.push(cp.id);
    }

    let remaining = coord.checkpoint_list(&task.id).await.unwrap();
    assert_eq!(remaining.len(), 5);
    let sequences: Vec<i64> = remaining.iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, vec![7, 6, 5, 4, 3]);
    assert!(coord.checkpoint_get(&ids[0]).await.unwrap().is_none());
    assert!(coord.checkpoint_get(&ids[1]).await.unwrap().is_none());
}

#[tokio::test]
async fn repeated_iteration_loops_respect_checkpoint_cap() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Looped work".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();

    // Seven full start/complete cycles on the same task: each start mints a
    // fresh iteration checkpoint, and the per-task retention cap must hold
    // throughout.
    let mut live_iteration_id = String::new();
    for _ in 0..7 {
        let started = coord
            .iteration_start(IterationStartParams {
                task_id: task.id.clone(),
                max_iterations: 2,
                completion_promises: vec!["<promise>COMPLETE</promise>".into()],
                validation_rules: vec![],
                circuit_breaker_threshold: None,
            })
            .await
            .unwrap();
        live_iteration_id = started.iteration_id.clone();

        coord
            .iteration_complete(IterationCompleteParams {
                iteration_id: started.iteration_id,
                completion_promise: "<promise>COMPLETE</promise>".into(),
                work_product_id: None,
            })
            .await
            .unwrap();

        let checkpoints = coord.checkpoint_list(&task.id).await.unwrap();
        assert!(checkpoints.len() <= 5);
    }

    // Only the most recent loop's state is guaranteed to survive
    assert!(coord
        .checkpoint_get(&live_iteration_id)
        .await
        .unwrap()
        .is_some());
    assert!(coord.checkpoint_list(&task.id).await.unwrap().len() <= 5);
}

#[tokio::test]
async fn checkpoint_resume_reconstructs_state() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Resumable work".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();

    coord
        .checkpoint_create(CheckpointCreateParams {
            task_id: task.id.clone(),
            execution_phase: Some("implementation".into()),
            execution_step: Some("wiring the parser".into()),
            draft_content: Some("draft body ".repeat(50)),
            draft_type: Some("markdown".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let resumed = coord
        .checkpoint_resume(CheckpointResumeParams {
            task_id: task.id.clone(),
            checkpoint_id: None,
        })
        .await
        .unwrap()
        .unwrap();
    assert!(resumed.has_draft);
    assert!(resumed.draft_preview.unwrap().chars().count() <= 200);
    assert_eq!(resumed.execution_phase.as_deref(), Some("implementation"));
    assert!(resumed.resume_instructions.contains("Resumable work"));
    assert!(resumed.resume_instructions.contains("implementation"));

    // Unknown task resolves to null
    let missing = coord
        .checkpoint_resume(CheckpointResumeParams {
            task_id: "TASK-missing".into(),
            checkpoint_id: None,
        })
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn checkpoint_cleanup_is_idempotent() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Cleanup".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();
    for _ in 0..3 {
        coord
            .checkpoint_create(CheckpointCreateParams {
                task_id: task.id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let params = CheckpointCleanupParams {
        task_id: Some(task.id.clone()),
        keep_latest: Some(5),
        ..Default::default()
    };
    let first = coord.checkpoint_cleanup(params.clone()).await.unwrap();
    assert_eq!(first.deleted, 0);
    assert_eq!(first.remaining, 3);
    let second = coord.checkpoint_cleanup(params).await.unwrap();
    assert_eq!(second.deleted, 0);
    assert_eq!(second.remaining, 3);
}

#[tokio::test]
async fn handoff_chain_maps_final_product_to_unknown() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Design pipeline".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut product_ids = Vec::new();
    for title in ["system design", "ux flows", "ui mockups"] {
        let stored = coord
            .work_product_store(WorkProductStoreParams {
                task_id: task.id.clone(),
                product_type: WorkProductType::TechnicalDesign,
                title: title.into(),
                content: format!("{title} content"),
                metadata: Metadata::new(),
            })
            .await
            .unwrap();
        product_ids.push(stored.id);
    }

    coord
        .agent_handoff(AgentHandoffParams {
            task_id: task.id.clone(),
            from_agent: "SD".into(),
            to_agent: "UXD".into(),
            work_product_id: product_ids[0].clone(),
            handoff_context: "system design ready".into(),
            chain_position: 1,
            chain_length: 3,
        })
        .await
        .unwrap();
    coord
        .agent_handoff(AgentHandoffParams {
            task_id: task.id.clone(),
            from_agent: "UXD".into(),
            to_agent: "UID".into(),
            work_product_id: product_ids[1].clone(),
            handoff_context: "flows done".into(),
            chain_position: 2,
            chain_length: 3,
        })
        .await
        .unwrap();

    let chain = coord.agent_chain_get(&task.id).await.unwrap().unwrap();
    assert_eq!(chain.handoffs.len(), 2);
    assert_eq!(chain.handoffs[0].chain_position, 1);
    assert_eq!(chain.handoffs[1].chain_position, 2);
    assert_eq!(chain.work_products[0].agent, "SD");
    assert_eq!(chain.work_products[1].agent, "UXD");
    assert_eq!(chain.work_products[2].agent, "unknown");
}

#[tokio::test]
async fn handoff_context_limit_enforced() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let task = coord
        .task_create(NewTask {
            title: "Handoffs".into(),
            prd_id: Some(prd),
            ..Default::default()
        })
        .await
        .unwrap();
    let wp = coord
        .work_product_store(WorkProductStoreParams {
            task_id: task.id.clone(),
            product_type: WorkProductType::Other,
            title: "artifact".into(),
            content: "body".into(),
            metadata: Metadata::new(),
        })
        .await
        .unwrap();

    let err = coord
        .agent_handoff(AgentHandoffParams {
            task_id: task.id.clone(),
            from_agent: "a".into(),
            to_agent: "b".into(),
            work_product_id: wp.id.clone(),
            handoff_context: "x".repeat(51),
            chain_position: 1,
            chain_length: 1,
        })
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = coord
        .agent_handoff(AgentHandoffParams {
            task_id: task.id,
            from_agent: "a".into(),
            to_agent: "b".into(),
            work_product_id: wp.id,
            handoff_context: "fine".into(),
            chain_position: 3,
            chain_length: 2,
        })
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn initiative_relink_is_idempotent() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    coord.task_create(stream_task(&prd, "T1", "Stream-A", &[])).await.unwrap();

    let response = coord
        .initiative_link(InitiativeLinkParams {
            initiative_id: "INIT-001".into(),
            title: None,
            description: String::new(),
        })
        .await
        .unwrap();
    assert!(response.already_current);
    assert_eq!(response.archived_tasks, 0);

    // Nothing was archived by the re-link
    let visible = coord.stream_list(StreamListParams::default()).await.unwrap();
    assert_eq!(visible.len(), 1);
}

#[tokio::test]
async fn archive_then_unarchive_restores_stream_list() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    coord.task_create(stream_task(&prd, "T1", "Stream-A", &[])).await.unwrap();
    coord.task_create(stream_task(&prd, "T2", "Stream-B", &[])).await.unwrap();

    let before: Vec<String> = coord
        .stream_list(StreamListParams::default())
        .await
        .unwrap()
        .iter()
        .map(|s| s.stream_id.clone())
        .collect();

    coord
        .stream_archive_all(engine::streams::StreamArchiveAllParams { confirm: true })
        .await
        .unwrap();
    assert!(coord
        .stream_list(StreamListParams::default())
        .await
        .unwrap()
        .is_empty());

    for stream in ["Stream-A", "Stream-B"] {
        coord
            .stream_unarchive(StreamUnarchiveParams {
                stream_id: stream.into(),
                new_initiative_id: None,
                prd_id: None,
            })
            .await
            .unwrap();
    }

    let after: Vec<String> = coord
        .stream_list(StreamListParams::default())
        .await
        .unwrap()
        .iter()
        .map(|s| s.stream_id.clone())
        .collect();
    assert_eq!(before, after);

    // Unarchiving a stream with no archived tasks fails
    let err = coord
        .stream_unarchive(StreamUnarchiveParams {
            stream_id: "Stream-A".into(),
            new_initiative_id: None,
            prd_id: None,
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn worktree_isolated_stream_reports_no_conflicts() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;

    let mut other = stream_task(&prd, "other", "Stream-B", &[]);
    other
        .metadata
        .insert("files".into(), json!(["src/shared.rs"]));
    let other = coord.task_create(other).await.unwrap();
    coord
        .task_update(TaskUpdateParams {
            task_id: other.id,
            update: UpdateTask {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    // Plain overlap conflicts
    let conflicts = coord
        .stream_conflict_check(StreamConflictParams {
            files: vec!["src/shared.rs".into()],
            exclude_stream_id: Some("Stream-A".into()),
        })
        .await
        .unwrap();
    assert!(conflicts.has_conflicts);
    assert_eq!(conflicts.conflicts[0].stream_id, "Stream-B");
    assert_eq!(conflicts.conflicts[0].file, "src/shared.rs");

    // Give the requesting stream a worktree: fully isolated
    let mut isolated = stream_task(&prd, "isolated", "Stream-A", &[]);
    isolated
        .metadata
        .insert("worktreePath".into(), json!("/tmp/worktrees/stream-a"));
    coord.task_create(isolated).await.unwrap();

    let conflicts = coord
        .stream_conflict_check(StreamConflictParams {
            files: vec!["src/shared.rs".into()],
            exclude_stream_id: Some("Stream-A".into()),
        })
        .await
        .unwrap();
    assert!(!conflicts.has_conflicts);
    assert!(conflicts.isolated);
}

#[tokio::test]
async fn stream_get_derives_overall_status() {
    let (coord, _dir) = coordinator().await;
    link_initiative(&coord, "INIT-001").await;
    let prd = create_prd(&coord).await;
    let t1 = coord.task_create(stream_task(&prd, "T1", "Stream-A", &[])).await.unwrap();
    coord.task_create(stream_task(&prd, "T2", "Stream-A", &[])).await.unwrap();

    let stream = coord
        .stream_get(StreamGetParams {
            stream_id: "Stream-A".into(),
            include_archived: false,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stream.status, TaskStatus::Pending);
    assert_eq!(stream.tasks.len(), 2);

    coord
        .task_update(TaskUpdateParams {
            task_id: t1.id,
            update: UpdateTask {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    let stream = coord
        .stream_get(StreamGetParams {
            stream_id: "Stream-A".into(),
            include_archived: false,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stream.status, TaskStatus::InProgress);

    assert!(coord
        .stream_get(StreamGetParams {
            stream_id: "Stream-X".into(),
            include_archived: false,
        })
        .await
        .unwrap()
        .is_none());
}

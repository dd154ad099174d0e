use chrono::Utc;
use coord_core::{
    classify,
    error::{CoordError, Result},
    events::Event,
    graph, id,
    models::{
        CheckpointTrigger, Metadata, NewTask, PerformanceOutcome, PerformanceRecord, Task,
        TaskFilter, TaskStatus, UpdateTask, WorkProduct, WorkProductType,
    },
    validation,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::checkpoints::CheckpointCreateParams;
use crate::gates::GateReport;
use crate::Coordinator;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdateParams {
    pub task_id: String,
    #[serde(flatten)]
    pub update: UpdateTask,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub subtask_count: i64,
    pub completed_subtask_count: i64,
    pub has_work_products: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<Task>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_products: Option<Vec<WorkProductSummary>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkProductSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub product_type: WorkProductType,
    pub title: String,
    pub summary: String,
    pub word_count: usize,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGetParams {
    pub task_id: String,
    #[serde(default)]
    pub include_subtasks: bool,
    #[serde(default)]
    pub include_work_products: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdateResponse {
    #[serde(flatten)]
    pub task: Task,
    /// Present when a completion attempt ran the quality gates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_report: Option<GateReport>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkProductStoreParams {
    pub task_id: String,
    #[serde(rename = "type")]
    pub product_type: WorkProductType,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkProductStoreResponse {
    pub id: String,
    pub task_id: String,
    #[serde(rename = "type")]
    pub product_type: WorkProductType,
    pub title: String,
    pub summary: String,
    pub word_count: usize,
    pub created_at: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

impl Coordinator {
    /// Create a task, validating stream dependencies and auto-detecting the
    /// activation mode from its title and description.
    pub async fn task_create(&self, params: NewTask) -> Result<Task> {
        if params.title.trim().is_empty() {
            return Err(CoordError::empty_field("title"));
        }
        if params.prd_id.is_some() && params.parent_id.is_some() {
            return Err(CoordError::Validation(
                "A task takes at most one of prdId and parentId".into(),
            ));
        }
        if let Some(ref prd_id) = params.prd_id {
            if self.store.get_prd(prd_id).await?.is_none() {
                return Err(CoordError::not_found("PRD", prd_id));
            }
        }
        if let Some(ref parent_id) = params.parent_id {
            if self.store.get_task(parent_id).await?.is_none() {
                return Err(CoordError::not_found("Task", parent_id));
            }
        }

        let mut metadata = params.metadata;
        // An explicit activationMode key, even a null one, suppresses detection
        if !metadata.contains_key("activationMode") {
            if let Some(mode) = classify::detect_activation_mode(&params.title, &params.description)
            {
                metadata.insert("activationMode".into(), json!(mode.to_string()));
            }
        }

        let now = Utc::now();
        let task = Task {
            id: id::new_id(id::TASK),
            prd_id: params.prd_id,
            parent_id: params.parent_id,
            title: params.title,
            description: params.description,
            assigned_agent: params.assigned_agent,
            status: params.status.unwrap_or(TaskStatus::Pending),
            blocked_reason: None,
            notes: None,
            metadata,
            archived: false,
            archived_at: None,
            archived_by_initiative_id: None,
            created_at: now,
            updated_at: now,
        };

        self.validate_stream_edges(&task).await?;
        self.store.insert_task(&task).await?;

        let initiative = self.initiative_for_task(&task).await?;
        self.store
            .append_activity(
                &initiative,
                "task",
                &task.id,
                "task_created",
                &format!("Created task '{}'", task.title),
                &Metadata::new(),
            )
            .await?;

        Ok(task)
    }

    /// Update a task, enforcing the archived guard and the quality-gate
    /// completion transition.
    pub async fn task_update(&self, params: TaskUpdateParams) -> Result<TaskUpdateResponse> {
        let mut task = self
            .store
            .get_task(&params.task_id)
            .await?
            .ok_or_else(|| CoordError::not_found("Task", &params.task_id))?;

        if task.archived {
            return Err(CoordError::ArchivedTask {
                task_id: task.id.clone(),
                stream: task.stream_id().unwrap_or("none").to_string(),
                archived_by: task
                    .archived_by_initiative_id
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        let update = params.update;
        let old_status = task.status;
        let old_agent = task.assigned_agent.clone();

        if let Some(title) = update.title {
            task.title = title;
        }
        if let Some(description) = update.description {
            task.description = description;
        }
        if let Some(notes) = update.notes {
            task.notes = Some(notes);
        }
        if let Some(reason) = update.blocked_reason {
            task.blocked_reason = Some(reason);
        }
        if let Some(agent) = update.assigned_agent.clone() {
            task.assigned_agent = Some(agent);
        }
        if let Some(new_metadata) = update.metadata {
            // Shallow merge: incoming keys overlay existing ones
            for (key, value) in new_metadata {
                task.metadata.insert(key, value);
            }
            self.validate_stream_edges(&task).await?;
        }

        let mut gate_report = None;
        if let Some(new_status) = update.status {
            // completed -> completed is an idempotent no-op
            if !(new_status == TaskStatus::Completed && old_status == TaskStatus::Completed) {
                if new_status == TaskStatus::Completed {
                    gate_report = self.apply_completion_transition(&mut task).await?;
                } else {
                    task.status = new_status;
                }
            }
        }

        // Agent reassignment leaves a performance trace for the old agent
        if let (Some(previous), Some(current)) = (&old_agent, &task.assigned_agent) {
            if previous != current {
                self.record_performance(&task, previous, PerformanceOutcome::Reassigned)
                    .await?;
            }
        }

        if task.status != old_status {
            match task.status {
                TaskStatus::Completed => {
                    if let Some(ref agent) = task.assigned_agent {
                        let agent = agent.clone();
                        self.record_performance(&task, &agent, PerformanceOutcome::Success)
                            .await?;
                    }
                    self.stop_hooks.clear_task(&task.id);
                }
                TaskStatus::Cancelled => {
                    // A task cancelled while stuck counts as blocked, not failed
                    let outcome = if old_status == TaskStatus::Blocked {
                        PerformanceOutcome::Blocked
                    } else {
                        PerformanceOutcome::Failure
                    };
                    if let Some(ref agent) = task.assigned_agent {
                        let agent = agent.clone();
                        self.record_performance(&task, &agent, outcome).await?;
                    }
                    self.stop_hooks.clear_task(&task.id);
                }
                _ => {}
            }
        }

        self.store.update_task_row(&task).await?;

        let initiative = self.initiative_for_task(&task).await?;
        if task.status == old_status {
            self.store
                .append_activity(
                    &initiative,
                    "task",
                    &task.id,
                    "task_updated",
                    &format!("Updated task '{}'", task.title),
                    &Metadata::new(),
                )
                .await?;
        } else {
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

            // Auto-checkpoint on entering in_progress or blocked
            if self.options.auto_checkpoint
                && matches!(task.status, TaskStatus::InProgress | TaskStatus::Blocked)
            {
                self.checkpoint_create(CheckpointCreateParams {
                    task_id: task.id.clone(),
                    trigger: Some(CheckpointTrigger::AutoStatus),
                    ..Default::default()
                })
                .await?;
            }
        }

        Ok(TaskUpdateResponse { task, gate_report })
    }

    /// Run the quality gates for a `* -> completed` transition. A failing
    /// gate set rewrites the transition to blocked; the caller sees the
    /// rewritten status in the returned task.
    pub(crate) async fn apply_completion_transition(
        &self,
        task: &mut Task,
    ) -> Result<Option<GateReport>> {
        let gates = self.gates.effective_gates(task)?;
        if gates.is_empty() {
            task.status = TaskStatus::Completed;
            return Ok(None);
        }

        let report = self.gates.run_gates(task, &gates).await?;
        if report.all_passed {
            task.status = TaskStatus::Completed;
        } else {
            let failed = report.failed_names().join(", ");
            task.status = TaskStatus::Blocked;
            task.blocked_reason = Some(format!(
                "Quality gates failed: {failed}. {} of {} gates failed.",
                report.failed_gates, report.total_gates
            ));
            let mut details = String::new();
            for result in report.results.iter().filter(|r| !r.passed) {
                details.push_str(&format!(
                    "\n[gate {}] {}\n{}",
                    result.gate_name,
                    result.message,
                    if result.stderr.is_empty() {
                        &result.stdout
                    } else {
                        &result.stderr
                    }
                ));
            }
            task.notes = Some(match &task.notes {
                Some(existing) => format!("{existing}{details}"),
                None => details.trim_start().to_string(),
            });
        }
        Ok(Some(report))
    }

    pub async fn task_get(&self, params: TaskGetParams) -> Result<Option<TaskView>> {
        let Some(task) = self.store.get_task(&params.task_id).await? else {
            return Ok(None);
        };
        let view = self
            .build_task_view(task, params.include_subtasks, params.include_work_products)
            .await?;
        Ok(Some(view))
    }

    pub async fn task_list(&self, filter: TaskFilter) -> Result<Vec<TaskView>> {
        let tasks = self.store.list_tasks(&filter).await?;
        let mut views = Vec::with_capacity(tasks.len());
        for task in tasks {
            views.push(self.build_task_view(task, false, false).await?);
        }
        Ok(views)
    }

    async fn build_task_view(
        &self,
        task: Task,
        include_subtasks: bool,
        include_work_products: bool,
    ) -> Result<TaskView> {
        let (subtask_count, completed_subtask_count) = self.store.subtask_counts(&task.id).await?;
        let has_work_products = self.store.has_work_products(&task.id).await?;
        let subtasks = if include_subtasks {
            Some(self.store.subtasks(&task.id).await?)
        } else {
            None
        };
        let work_products = if include_work_products {
            let products = self.store.list_work_products(&task.id).await?;
            Some(
                products
                    .into_iter()
                    .map(|wp| WorkProductSummary {
                        summary: validation::summarize(&wp.content, 300),
                        word_count: validation::word_count(&wp.content),
                        id: wp.id,
                        product_type: wp.product_type,
                        title: wp.title,
                        created_at: wp.created_at,
                    })
                    .collect(),
            )
        } else {
            None
        };

        Ok(TaskView {
            task,
            subtask_count,
            completed_subtask_count,
            has_work_products,
            subtasks,
            work_products,
        })
    }

    /// Store an immutable work product after running the validator
    /// registry. A reject aborts; warnings and flags are persisted under
    /// `metadata.validation` and returned to the caller.
    pub async fn work_product_store(
        &self,
        params: WorkProductStoreParams,
    ) -> Result<WorkProductStoreResponse> {
        let task = self
            .store
            .get_task(&params.task_id)
            .await?
            .ok_or_else(|| CoordError::not_found("Task", &params.task_id))?;

        let mut product = WorkProduct {
            id: id::new_id(id::WORK_PRODUCT),
            task_id: params.task_id,
            product_type: params.product_type,
            title: params.title,
            content: params.content,
            metadata: params.metadata,
            created_at: Utc::now(),
        };

        let report = self.validators.run(&product);
        if report.rejected() {
            return Err(CoordError::Validation(format!(
                "Work product rejected: {}",
                report.rejection_feedback()
            )));
        }
        if !report.is_clean() {
            product.metadata.insert(
                "validation".into(),
                json!({
                    "warnings": report.warnings,
                    "flags": report.flags,
                }),
            );
        }

        self.store.insert_work_product(&product).await?;

        let initiative = self.initiative_for_task(&task).await?;
        self.store
            .append_activity(
                &initiative,
                "work_product",
                &product.id,
                "work_product_stored",
                &format!("Stored {} '{}'", product.product_type, product.title),
                &Metadata::new(),
            )
            .await?;

        Ok(WorkProductStoreResponse {
            summary: validation::summarize(&product.content, 300),
            word_count: validation::word_count(&product.content),
            id: product.id,
            task_id: product.task_id,
            product_type: product.product_type,
            title: product.title,
            created_at: product.created_at,
            warnings: report.warnings,
            flags: report.flags,
        })
    }

    pub async fn work_product_get(&self, work_product_id: &str) -> Result<Option<WorkProduct>> {
        self.store.get_work_product(work_product_id).await
    }

    pub async fn work_product_list(&self, task_id: &str) -> Result<Vec<WorkProduct>> {
        self.store.list_work_products(task_id).await
    }

    /// Cycle-check the stream graph with this task's edges included.
    async fn validate_stream_edges(&self, task: &Task) -> Result<()> {
        let Some(stream_id) = task.stream_id() else {
            return Ok(());
        };
        let deps = task.stream_dependencies();
        let mut map = self.store.stream_dependency_map().await?;
        let entry = map.entry(stream_id.to_string()).or_default();
        for dep in deps {
            if !entry.contains(&dep) {
                entry.push(dep);
            }
        }
        graph::validate_stream_dependencies(&map, stream_id)
    }

    pub(crate) async fn record_performance(
        &self,
        task: &Task,
        agent: &str,
        outcome: PerformanceOutcome,
    ) -> Result<()> {
        let record = PerformanceRecord {
            id: id::new_id(id::PERFORMANCE),
            agent_id: agent.to_string(),
            task_id: task.id.clone(),
            work_product_type: None,
            complexity: task
                .metadata
                .get("complexity")
                .and_then(Value::as_str)
                .map(str::to_string),
            outcome,
            duration_ms: None,
            created_at: Utc::now(),
        };
        self.store.insert_performance(&record).await
    }
}

use chrono::{DateTime, Utc};
use coord_core::{
    classify,
    error::{CoordError, Result},
    id,
    models::{
        ActivityEntry, Handoff, Initiative, Metadata, PerformanceOutcome, PerformanceRecord, Prd,
        PrdStatus, PrdType, ProtocolViolation, ScopeChange, ScopeChangeStatus, ScopeChangeType,
        Severity, Task, TaskStatus, WorkProduct,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Coordinator;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeLinkParams {
    pub initiative_id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeLinkResponse {
    pub initiative: Initiative,
    pub already_current: bool,
    pub previous_initiative_id: Option<String>,
    /// Stream tasks auto-archived because the workspace switched initiative
    pub archived_tasks: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeArchiveParams {
    pub initiative_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeArchiveResponse {
    pub initiative_id: String,
    pub archive_path: String,
    pub archived_at: DateTime<Utc>,
    pub prd_count: usize,
    pub task_count: usize,
    pub work_product_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeWipeParams {
    pub initiative_id: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

/// Archive file written by `initiative_archive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveFile {
    pub version: String,
    pub archived_at: DateTime<Utc>,
    pub initiative: Initiative,
    pub prds: Vec<Prd>,
    pub tasks: Vec<Task>,
    pub work_products: Vec<WorkProduct>,
    pub activity_log: Vec<ActivityEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdCreateParams {
    pub initiative_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    pub prd_type: Option<PrdType>,
    pub scope_locked: Option<bool>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeChangeRequestParams {
    pub prd_id: String,
    pub request_type: ScopeChangeType,
    pub description: String,
    #[serde(default)]
    pub rationale: String,
    pub requested_by: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeChangeReviewParams {
    pub request_id: String,
    pub approve: bool,
    pub reviewed_by: String,
    pub review_notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeChangeListParams {
    pub prd_id: Option<String>,
    pub status: Option<ScopeChangeStatus>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHandoffParams {
    pub task_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub work_product_id: String,
    pub handoff_context: String,
    pub chain_position: u32,
    pub chain_length: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainWorkProduct {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub product_type: coord_core::models::WorkProductType,
    /// Agent that produced this work product, taken from the handoff that
    /// references it; "unknown" for the final agent in the chain.
    pub agent: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentChainResponse {
    pub task_id: String,
    pub handoffs: Vec<Handoff>,
    pub work_products: Vec<ChainWorkProduct>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPerformanceResponse {
    pub agent_id: String,
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub blocked: usize,
    pub reassigned: usize,
    pub records: Vec<PerformanceRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationLogParams {
    pub violation_type: String,
    pub severity: Severity,
    pub context: Option<Value>,
    pub suggestion: Option<String>,
    pub initiative_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationsGetParams {
    pub session_id: Option<String>,
    pub initiative_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneProgress {
    pub prd_id: String,
    pub milestone_id: String,
    pub name: String,
    pub total_tasks: usize,
    pub completed_tasks: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub initiative: Option<Initiative>,
    pub prd_count: usize,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub task_counts: std::collections::HashMap<String, u64>,
    pub completion_percent: f64,
    /// Milestone rollups aggregated across the initiative's PRDs; purely a
    /// presentation concern, milestones themselves live in PRD metadata.
    pub milestones: Vec<MilestoneProgress>,
}

impl Coordinator {
    /// Link an initiative as the workspace's current one.
    ///
    /// Re-linking the current id is a no-op. Switching away auto-archives
    /// every task that belongs to any stream, stamped with the initiative
    /// that was current before the switch.
    pub async fn initiative_link(
        &self,
        params: InitiativeLinkParams,
    ) -> Result<InitiativeLinkResponse> {
        if params.initiative_id.trim().is_empty() {
            return Err(CoordError::empty_field("initiativeId"));
        }
        let previous = self.store.current_initiative_id().await?;

        if previous.as_deref() == Some(params.initiative_id.as_str()) {
            let initiative = self
                .store
                .get_initiative(&params.initiative_id)
                .await?
                .ok_or_else(|| CoordError::not_found("Initiative", &params.initiative_id))?;
            return Ok(InitiativeLinkResponse {
                initiative,
                already_current: true,
                previous_initiative_id: previous,
                archived_tasks: 0,
            });
        }

        let title = params
            .title
            .unwrap_or_else(|| params.initiative_id.clone());
        let initiative = self
            .store
            .upsert_initiative(&params.initiative_id, &title, &params.description)
            .await?;

        let mut archived_tasks = 0;
        if let Some(ref prev) = previous {
            archived_tasks = self
                .store
                .archive_all_stream_tasks(prev, Utc::now())
                .await?;
            tracing::info!(
                previous = prev.as_str(),
                current = params.initiative_id.as_str(),
                archived_tasks,
                "initiative switch archived stream tasks"
            );
        }
        self.store
            .set_current_initiative(&params.initiative_id)
            .await?;

        self.store
            .append_activity(
                &params.initiative_id,
                "initiative",
                &params.initiative_id,
                "initiative_linked",
                &format!("Linked initiative {}", params.initiative_id),
                &Metadata::new(),
            )
            .await?;

        Ok(InitiativeLinkResponse {
            initiative,
            already_current: false,
            previous_initiative_id: previous,
            archived_tasks,
        })
    }

    /// Export an initiative's dependents to an archive file, then wipe them
    /// from the store. The initiative row itself survives.
    pub async fn initiative_archive(
        &self,
        params: InitiativeArchiveParams,
    ) -> Result<InitiativeArchiveResponse> {
        let initiative_id = self.resolve_initiative_id(params.initiative_id).await?;
        let initiative = self
            .store
            .get_initiative(&initiative_id)
            .await?
            .ok_or_else(|| CoordError::not_found("Initiative", &initiative_id))?;

        let snapshot = self.store.collect_initiative(&initiative_id).await?;
        let archived_at = Utc::now();
        let archive = ArchiveFile {
            version: "1.0".into(),
            archived_at,
            initiative,
            prds: snapshot.prds,
            tasks: snapshot.tasks,
            work_products: snapshot.work_products,
            activity_log: snapshot.activity_log,
        };

        let path = self
            .options
            .store_dir
            .join(format!("coord-archive.{initiative_id}.json"));
        std::fs::create_dir_all(&self.options.store_dir)
            .map_err(|e| CoordError::Store(format!("Cannot create archive directory: {e}")))?;
        std::fs::write(&path, serde_json::to_string_pretty(&archive)?)
            .map_err(|e| CoordError::Store(format!("Cannot write archive file: {e}")))?;

        self.store
            .delete_initiative_dependents(&initiative_id)
            .await?;

        Ok(InitiativeArchiveResponse {
            initiative_id,
            archive_path: path.display().to_string(),
            archived_at,
            prd_count: archive.prds.len(),
            task_count: archive.tasks.len(),
            work_product_count: archive.work_products.len(),
        })
    }

    /// Destroy an initiative's dependents without an export. Guarded by an
    /// explicit confirm switch.
    pub async fn initiative_wipe(&self, params: InitiativeWipeParams) -> Result<Value> {
        if !params.confirm {
            return Err(CoordError::Validation(
                "initiative_wipe requires confirm: true".into(),
            ));
        }
        let initiative_id = self.resolve_initiative_id(params.initiative_id).await?;
        if self.store.get_initiative(&initiative_id).await?.is_none() {
            return Err(CoordError::not_found("Initiative", &initiative_id));
        }
        self.store
            .delete_initiative_dependents(&initiative_id)
            .await?;
        Ok(serde_json::json!({
            "initiativeId": initiative_id,
            "wiped": true,
            "timestamp": Utc::now(),
        }))
    }

    pub async fn prd_create(&self, params: PrdCreateParams) -> Result<Prd> {
        if params.title.trim().is_empty() {
            return Err(CoordError::empty_field("title"));
        }
        let initiative_id = self.resolve_initiative_id(params.initiative_id).await?;
        if self.store.get_initiative(&initiative_id).await?.is_none() {
            return Err(CoordError::not_found("Initiative", &initiative_id));
        }

        let prd_type = params
            .prd_type
            .unwrap_or_else(|| classify::classify_prd(&params.title, &params.description));
        let scope_locked = params
            .scope_locked
            .unwrap_or_else(|| prd_type.default_scope_locked());

        let now = Utc::now();
        let prd = Prd {
            id: id::new_id(id::PRD),
            initiative_id: initiative_id.clone(),
            title: params.title,
            description: params.description,
            content: params.content,
            prd_type,
            scope_locked,
            status: PrdStatus::Active,
            metadata: params.metadata,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_prd(&prd).await?;

        self.store
            .append_activity(
                &initiative_id,
                "prd",
                &prd.id,
                "prd_created",
                &format!("Created PRD '{}' ({})", prd.title, prd.prd_type),
                &Metadata::new(),
            )
            .await?;

        Ok(prd)
    }

    pub async fn prd_get(&self, prd_id: &str) -> Result<Option<Prd>> {
        self.store.get_prd(prd_id).await
    }

    pub async fn prd_list(&self, initiative_id: Option<String>) -> Result<Vec<Prd>> {
        let initiative_id = match initiative_id {
            Some(id) => Some(id),
            None => self.store.current_initiative_id().await?,
        };
        self.store.list_prds(initiative_id.as_deref()).await
    }

    /// File a scope-change request against a scope-locked PRD.
    pub async fn scope_change_request(
        &self,
        params: ScopeChangeRequestParams,
    ) -> Result<ScopeChange> {
        let prd = self
            .store
            .get_prd(&params.prd_id)
            .await?
            .ok_or_else(|| CoordError::not_found("PRD", &params.prd_id))?;
        if !prd.scope_locked {
            return Err(CoordError::Validation(format!(
                "PRD {} is not scope-locked; change the tasks directly",
                prd.id
            )));
        }
        if params.description.trim().is_empty() {
            return Err(CoordError::empty_field("description"));
        }

        let change = ScopeChange {
            id: id::new_id(id::SCOPE_CHANGE),
            prd_id: params.prd_id,
            request_type: params.request_type,
            description: params.description,
            rationale: params.rationale,
            requested_by: params.requested_by,
            status: ScopeChangeStatus::Pending,
            reviewed_at: None,
            reviewed_by: None,
            review_notes: None,
            created_at: Utc::now(),
        };
        self.store.insert_scope_change(&change).await?;

        self.store
            .append_activity(
                &prd.initiative_id,
                "scope_change",
                &change.id,
                "scope_change_requested",
                &format!("{} requested for PRD {}", change.request_type, prd.id),
                &Metadata::new(),
            )
            .await?;

        Ok(change)
    }

    /// One-shot review: only a pending request can be reviewed.
    pub async fn scope_change_review(
        &self,
        params: ScopeChangeReviewParams,
    ) -> Result<ScopeChange> {
        let change = self
            .store
            .get_scope_change(&params.request_id)
            .await?
            .ok_or_else(|| CoordError::not_found("Scope change", &params.request_id))?;
        if change.status != ScopeChangeStatus::Pending {
            return Err(CoordError::Validation(format!(
                "Scope change {} was already reviewed ({})",
                change.id, change.status
            )));
        }

        let status = if params.approve {
            ScopeChangeStatus::Approved
        } else {
            ScopeChangeStatus::Rejected
        };
        self.store
            .record_scope_change_review(
                &change.id,
                status,
                &params.reviewed_by,
                params.review_notes.as_deref(),
            )
            .await?;

        if let Some(prd) = self.store.get_prd(&change.prd_id).await? {
            self.store
                .append_activity(
                    &prd.initiative_id,
                    "scope_change",
                    &change.id,
                    "scope_change_reviewed",
                    &format!("{} by {}", status, params.reviewed_by),
                    &Metadata::new(),
                )
                .await?;
        }

        self.store
            .get_scope_change(&change.id)
            .await?
            .ok_or_else(|| CoordError::not_found("Scope change", &change.id))
    }

    pub async fn scope_change_list(
        &self,
        params: ScopeChangeListParams,
    ) -> Result<Vec<ScopeChange>> {
        self.store
            .list_scope_changes(params.prd_id.as_deref(), params.status)
            .await
    }

    /// Record an agent-to-agent handoff. The bounded context keeps
    /// intermediate outputs out of the outer session.
    pub async fn agent_handoff(&self, params: AgentHandoffParams) -> Result<Handoff> {
        if params.handoff_context.chars().count() > 50 {
            return Err(CoordError::Validation(format!(
                "Handoff context exceeds 50 characters ({})",
                params.handoff_context.chars().count()
            )));
        }
        if params.chain_position < 1 || params.chain_position > params.chain_length {
            return Err(CoordError::Validation(format!(
                "Chain position {} out of range [1, {}]",
                params.chain_position, params.chain_length
            )));
        }
        let task = self
            .store
            .get_task(&params.task_id)
            .await?
            .ok_or_else(|| CoordError::not_found("Task", &params.task_id))?;
        if self
            .store
            .get_work_product(&params.work_product_id)
            .await?
            .is_none()
        {
            return Err(CoordError::not_found(
                "Work product",
                &params.work_product_id,
            ));
        }

        let handoff = Handoff {
            id: id::new_id(id::HANDOFF),
            task_id: params.task_id,
            from_agent: params.from_agent,
            to_agent: params.to_agent,
            work_product_id: params.work_product_id,
            handoff_context: params.handoff_context,
            chain_position: params.chain_position,
            chain_length: params.chain_length,
            created_at: Utc::now(),
        };
        self.store.insert_handoff(&handoff).await?;

        let initiative = self.initiative_for_task(&task).await?;
        self.store
            .append_activity(
                &initiative,
                "handoff",
                &handoff.id,
                "agent_handoff",
                &format!(
                    "{} → {} ({}/{})",
                    handoff.from_agent,
                    handoff.to_agent,
                    handoff.chain_position,
                    handoff.chain_length
                ),
                &Metadata::new(),
            )
            .await?;

        Ok(handoff)
    }

    /// Handoffs in chain order plus each work product mapped to the agent
    /// that recorded a handoff for it.
    pub async fn agent_chain_get(&self, task_id: &str) -> Result<Option<AgentChainResponse>> {
        if self.store.get_task(task_id).await?.is_none() {
            return Ok(None);
        }
        let handoffs = self.store.list_handoffs(task_id).await?;
        let products = self.store.list_work_products(task_id).await?;

        let work_products = products
            .into_iter()
            .map(|wp| {
                let agent = handoffs
                    .iter()
                    .find(|h| h.work_product_id == wp.id)
                    .map(|h| h.from_agent.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                ChainWorkProduct {
                    id: wp.id,
                    title: wp.title,
                    product_type: wp.product_type,
                    agent,
                }
            })
            .collect();

        Ok(Some(AgentChainResponse {
            task_id: task_id.to_string(),
            handoffs,
            work_products,
        }))
    }

    pub async fn agent_performance_get(&self, agent_id: &str) -> Result<AgentPerformanceResponse> {
        let records = self.store.list_performance(agent_id).await?;
        let count = |outcome: PerformanceOutcome| {
            records.iter().filter(|r| r.outcome == outcome).count()
        };
        Ok(AgentPerformanceResponse {
            agent_id: agent_id.to_string(),
            total: records.len(),
            success: count(PerformanceOutcome::Success),
            failure: count(PerformanceOutcome::Failure),
            blocked: count(PerformanceOutcome::Blocked),
            reassigned: count(PerformanceOutcome::Reassigned),
            records,
        })
    }

    pub async fn protocol_violation_log(
        &self,
        params: ViolationLogParams,
    ) -> Result<ProtocolViolation> {
        let initiative_id = match params.initiative_id {
            Some(id) => Some(id),
            None => self.store.current_initiative_id().await?,
        };
        let violation = ProtocolViolation {
            id: id::new_id(id::VIOLATION),
            session_id: self.session_id.clone(),
            initiative_id,
            violation_type: params.violation_type,
            severity: params.severity,
            context: params.context,
            suggestion: params.suggestion,
            created_at: Utc::now(),
        };
        self.store.insert_violation(&violation).await?;
        Ok(violation)
    }

    pub async fn protocol_violations_get(
        &self,
        params: ViolationsGetParams,
    ) -> Result<Vec<ProtocolViolation>> {
        let session = params
            .session_id
            .unwrap_or_else(|| self.session_id.clone());
        self.store
            .list_violations(Some(&session), params.initiative_id.as_deref())
            .await
    }

    /// Rollup over the initiative's PRDs, tasks, and milestones.
    pub async fn progress_summary(
        &self,
        initiative_id: Option<String>,
    ) -> Result<ProgressSummary> {
        let initiative_id = match initiative_id {
            Some(id) => Some(id),
            None => self.store.current_initiative_id().await?,
        };
        let Some(initiative_id) = initiative_id else {
            return Ok(ProgressSummary {
                initiative: None,
                prd_count: 0,
                total_tasks: 0,
                completed_tasks: 0,
                task_counts: Default::default(),
                completion_percent: 0.0,
                milestones: vec![],
            });
        };

        let initiative = self.store.get_initiative(&initiative_id).await?;
        let prds = self.store.list_prds(Some(&initiative_id)).await?;
        let counts = self.store.task_status_counts(&initiative_id).await?;
        let total_tasks: u64 = counts.values().sum();
        let completed_tasks = counts.get(&TaskStatus::Completed).copied().unwrap_or(0);

        let mut milestones = Vec::new();
        for prd in &prds {
            for milestone in prd.milestones() {
                let mut completed = 0;
                for task_id in &milestone.task_ids {
                    if let Some(task) = self.store.get_task(task_id).await? {
                        if task.status == TaskStatus::Completed {
                            completed += 1;
                        }
                    }
                }
                milestones.push(MilestoneProgress {
                    prd_id: prd.id.clone(),
                    milestone_id: milestone.id,
                    name: milestone.name,
                    total_tasks: milestone.task_ids.len(),
                    completed_tasks: completed,
                });
            }
        }

        Ok(ProgressSummary {
            initiative,
            prd_count: prds.len(),
            completion_percent: if total_tasks == 0 {
                0.0
            } else {
                completed_tasks as f64 * 100.0 / total_tasks as f64
            },
            task_counts: counts
                .into_iter()
                .map(|(status, count)| (status.to_string(), count))
                .collect(),
            total_tasks,
            completed_tasks,
            milestones,
        })
    }

    async fn resolve_initiative_id(&self, explicit: Option<String>) -> Result<String> {
        match explicit {
            Some(id) => Ok(id),
            None => self
                .store
                .current_initiative_id()
                .await?
                .ok_or_else(|| CoordError::Validation("No current initiative linked".into())),
        }
    }
}

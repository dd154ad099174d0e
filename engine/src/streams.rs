use std::collections::{BTreeMap, HashSet};

use coord_core::{
    error::{CoordError, Result},
    models::{Metadata, StreamPhase, Task, TaskStatus},
};
use serde::{Deserialize, Serialize};

use crate::Coordinator;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamListParams {
    pub initiative_id: Option<String>,
    pub prd_id: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

/// Aggregated view of one derived stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub stream_id: String,
    pub stream_name: Option<String>,
    pub phase: Option<StreamPhase>,
    pub dependencies: Vec<String>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub in_progress_tasks: usize,
    pub blocked_tasks: usize,
    pub pending_tasks: usize,
    pub files: Vec<String>,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub archived: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamGetParams {
    pub stream_id: String,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamGetResponse {
    #[serde(flatten)]
    pub summary: StreamSummary,
    /// Derived overall status of the stream
    pub status: TaskStatus,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConflictParams {
    pub files: Vec<String>,
    pub exclude_stream_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConflict {
    pub file: String,
    pub stream_id: String,
    pub stream_name: Option<String>,
    pub task_id: String,
    pub task_title: String,
    pub task_status: TaskStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConflictResponse {
    pub has_conflicts: bool,
    pub conflicts: Vec<StreamConflict>,
    /// True when the excluded stream is worktree-isolated and therefore
    /// exempt from conflict detection entirely
    pub isolated: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamArchiveAllParams {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamUnarchiveParams {
    pub stream_id: String,
    pub new_initiative_id: Option<String>,
    pub prd_id: Option<String>,
}

impl Coordinator {
    /// Aggregate stream summaries, ordered by phase (foundation < parallel
    /// < integration) then stream name.
    pub async fn stream_list(&self, params: StreamListParams) -> Result<Vec<StreamSummary>> {
        let tasks = self
            .store
            .stream_tasks(
                params.initiative_id.as_deref(),
                params.prd_id.as_deref(),
                params.include_archived,
            )
            .await?;

        let mut grouped: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        for task in tasks {
            if let Some(stream_id) = task.stream_id() {
                grouped.entry(stream_id.to_string()).or_default().push(task);
            }
        }

        let mut summaries: Vec<StreamSummary> = grouped
            .into_iter()
            .map(|(stream_id, tasks)| summarize_stream(stream_id, &tasks))
            .collect();

        summaries.sort_by(|a, b| {
            phase_rank(a.phase)
                .cmp(&phase_rank(b.phase))
                .then_with(|| a.stream_name.cmp(&b.stream_name))
        });
        Ok(summaries)
    }

    /// One stream's tasks plus a derived overall status.
    pub async fn stream_get(&self, params: StreamGetParams) -> Result<Option<StreamGetResponse>> {
        let tasks = self
            .store
            .tasks_by_stream(&params.stream_id, params.include_archived)
            .await?;
        if tasks.is_empty() {
            return Ok(None);
        }

        let status = derive_stream_status(&tasks);
        let summary = summarize_stream(params.stream_id, &tasks);
        Ok(Some(StreamGetResponse {
            summary,
            status,
            tasks,
        }))
    }

    /// File-conflict detection. Worktree-isolated streams never conflict:
    /// an isolated requester short-circuits to "no conflicts", and isolated
    /// candidates are skipped.
    pub async fn stream_conflict_check(
        &self,
        params: StreamConflictParams,
    ) -> Result<StreamConflictResponse> {
        if let Some(ref excluded) = params.exclude_stream_id {
            let own_tasks = self.store.tasks_by_stream(excluded, false).await?;
            if own_tasks.iter().any(|t| t.worktree_path().is_some()) {
                return Ok(StreamConflictResponse {
                    has_conflicts: false,
                    conflicts: vec![],
                    isolated: true,
                });
            }
        }

        let candidates = self.store.tasks_declaring_files().await?;

        // Streams with any worktree-bearing task are isolated
        let mut isolated_streams: HashSet<String> = HashSet::new();
        for task in self.store.stream_tasks(None, None, false).await? {
            if task.worktree_path().is_some() {
                if let Some(stream) = task.stream_id() {
                    isolated_streams.insert(stream.to_string());
                }
            }
        }

        let mut conflicts = Vec::new();
        for file in &params.files {
            for task in &candidates {
                let stream_id = match task.stream_id() {
                    Some(id) => id.to_string(),
                    None => continue,
                };
                if Some(stream_id.as_str()) == params.exclude_stream_id.as_deref() {
                    continue;
                }
                if isolated_streams.contains(&stream_id) {
                    continue;
                }
                if !task.files().iter().any(|f| f == file) {
                    continue;
                }
                conflicts.push(StreamConflict {
                    file: file.clone(),
                    stream_name: task.stream_name().map(str::to_string),
                    stream_id,
                    task_id: task.id.clone(),
                    task_title: task.title.clone(),
                    task_status: task.status,
                });
            }
        }

        Ok(StreamConflictResponse {
            has_conflicts: !conflicts.is_empty(),
            conflicts,
            isolated: false,
        })
    }

    /// Archive every stream task, as `initiative_link` does on a switch,
    /// behind an explicit confirm switch.
    pub async fn stream_archive_all(
        &self,
        params: StreamArchiveAllParams,
    ) -> Result<serde_json::Value> {
        if !params.confirm {
            return Err(CoordError::Validation(
                "stream_archive_all requires confirm: true".into(),
            ));
        }
        let current = self
            .store
            .current_initiative_id()
            .await?
            .unwrap_or_else(|| "manual".to_string());
        let archived = self
            .store
            .archive_all_stream_tasks(&current, chrono::Utc::now())
            .await?;

        self.store
            .append_activity(
                &current,
                "stream",
                "all",
                "streams_archived",
                &format!("Archived {archived} stream tasks"),
                &Metadata::new(),
            )
            .await?;

        Ok(serde_json::json!({ "archivedTasks": archived }))
    }

    /// Restore an archived stream's tasks. Fails when nothing matches.
    pub async fn stream_unarchive(
        &self,
        params: StreamUnarchiveParams,
    ) -> Result<serde_json::Value> {
        let restored = self
            .store
            .unarchive_stream_tasks(&params.stream_id)
            .await?;
        if restored == 0 {
            return Err(CoordError::not_found(
                "Archived stream",
                &params.stream_id,
            ));
        }

        let initiative = if let Some(ref prd_id) = params.prd_id {
            self.store
                .get_prd(prd_id)
                .await?
                .map(|p| p.initiative_id)
                .ok_or_else(|| CoordError::not_found("PRD", prd_id))?
        } else if let Some(init) = params.new_initiative_id {
            init
        } else {
            self.store
                .current_initiative_id()
                .await?
                .unwrap_or_else(|| "unassigned".to_string())
        };

        self.store
            .append_activity(
                &initiative,
                "stream",
                &params.stream_id,
                "stream_unarchived",
                &format!("Restored stream {} ({restored} tasks)", params.stream_id),
                &Metadata::new(),
            )
            .await?;

        Ok(serde_json::json!({
            "streamId": params.stream_id,
            "restoredTasks": restored,
            "initiativeId": initiative,
        }))
    }
}

fn phase_rank(phase: Option<StreamPhase>) -> u8 {
    match phase {
        Some(StreamPhase::Foundation) => 0,
        Some(StreamPhase::Parallel) => 1,
        Some(StreamPhase::Integration) => 2,
        None => 3,
    }
}

fn summarize_stream(stream_id: String, tasks: &[Task]) -> StreamSummary {
    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();

    let mut files: Vec<String> = Vec::new();
    let mut dependencies: Vec<String> = Vec::new();
    let mut seen_files = HashSet::new();
    let mut seen_deps = HashSet::new();
    for task in tasks {
        for file in task.files() {
            if seen_files.insert(file.clone()) {
                files.push(file);
            }
        }
        for dep in task.stream_dependencies() {
            if seen_deps.insert(dep.clone()) {
                dependencies.push(dep);
            }
        }
    }

    // All tasks of a stream agree on name/phase; first-found is canonical
    let first = tasks.first();
    StreamSummary {
        stream_name: first.and_then(|t| t.stream_name().map(str::to_string)),
        phase: first.and_then(|t| t.stream_phase()),
        dependencies,
        total_tasks: tasks.len(),
        completed_tasks: count(TaskStatus::Completed),
        in_progress_tasks: count(TaskStatus::InProgress),
        blocked_tasks: count(TaskStatus::Blocked),
        pending_tasks: count(TaskStatus::Pending),
        files,
        worktree_path: tasks
            .iter()
            .find_map(|t| t.worktree_path().map(str::to_string)),
        branch_name: tasks
            .iter()
            .find_map(|t| t.branch_name().map(str::to_string)),
        archived: first.map(|t| t.archived).unwrap_or(false),
        stream_id,
    }
}

fn derive_stream_status(tasks: &[Task]) -> TaskStatus {
    if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
        TaskStatus::Completed
    } else if tasks.iter().any(|t| t.status == TaskStatus::Blocked) {
        TaskStatus::Blocked
    } else if tasks.iter().any(|t| t.status == TaskStatus::InProgress) {
        TaskStatus::InProgress
    } else {
        TaskStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(stream: &str, status: TaskStatus, extra: &[(&str, serde_json::Value)]) -> Task {
        let mut metadata = Metadata::new();
        metadata.insert("streamId".into(), json!(stream));
        for (key, value) in extra {
            metadata.insert((*key).into(), value.clone());
        }
        Task {
            id: coord_core::id::new_id("TASK"),
            prd_id: None,
            parent_id: None,
            title: "t".into(),
            description: String::new(),
            assigned_agent: None,
            status,
            blocked_reason: None,
            notes: None,
            metadata,
            archived: false,
            archived_at: None,
            archived_by_initiative_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_derive_stream_status_priority() {
        let tasks = vec![
            task("s", TaskStatus::Completed, &[]),
            task("s", TaskStatus::Completed, &[]),
        ];
        assert_eq!(derive_stream_status(&tasks), TaskStatus::Completed);

        let tasks = vec![
            task("s", TaskStatus::Completed, &[]),
            task("s", TaskStatus::Blocked, &[]),
            task("s", TaskStatus::InProgress, &[]),
        ];
        assert_eq!(derive_stream_status(&tasks), TaskStatus::Blocked);

        let tasks = vec![
            task("s", TaskStatus::Pending, &[]),
            task("s", TaskStatus::InProgress, &[]),
        ];
        assert_eq!(derive_stream_status(&tasks), TaskStatus::InProgress);

        let tasks = vec![task("s", TaskStatus::Pending, &[])];
        assert_eq!(derive_stream_status(&tasks), TaskStatus::Pending);
    }

    #[test]
    fn test_summarize_stream_unions() {
        let tasks = vec![
            task(
                "s",
                TaskStatus::InProgress,
                &[
                    ("streamName", json!("API")),
                    ("streamPhase", json!("foundation")),
                    ("files", json!(["a.rs", "b.rs"])),
                    ("streamDependencies", json!(["other"])),
                ],
            ),
            task(
                "s",
                TaskStatus::Pending,
                &[
                    ("files", json!(["b.rs", "c.rs"])),
                    ("worktreePath", json!("/tmp/wt")),
                ],
            ),
        ];
        let summary = summarize_stream("s".into(), &tasks);
        assert_eq!(summary.stream_name.as_deref(), Some("API"));
        assert_eq!(summary.phase, Some(StreamPhase::Foundation));
        assert_eq!(summary.files, vec!["a.rs", "b.rs", "c.rs"]);
        assert_eq!(summary.dependencies, vec!["other"]);
        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.in_progress_tasks, 1);
        assert_eq!(summary.worktree_path.as_deref(), Some("/tmp/wt"));
    }

    #[test]
    fn test_phase_rank_orders_unknown_last() {
        assert!(phase_rank(Some(StreamPhase::Foundation)) < phase_rank(Some(StreamPhase::Parallel)));
        assert!(phase_rank(Some(StreamPhase::Integration)) < phase_rank(None));
    }
}

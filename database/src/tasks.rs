use std::collections::HashMap;

use chrono::{DateTime, Utc};
use coord_core::{
    error::Result,
    models::{Task, TaskFilter, TaskStatus},
};
use sqlx::QueryBuilder;

use crate::common::{now, row_to_task, sqlx_error_to_coord_error, status_to_string};
use crate::store::CoordStore;

const TASK_COLUMNS: &str = "id, prd_id, parent_id, title, description, assigned_agent, status, \
     blocked_reason, notes, metadata, archived, archived_at, archived_by_initiative_id, \
     created_at, updated_at";

impl CoordStore {
    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO tasks (id, prd_id, parent_id, title, description, assigned_agent,
                                status, blocked_reason, notes, metadata, archived, archived_at,
                                archived_by_initiative_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.prd_id)
        .bind(&task.parent_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(&task.assigned_agent)
        .bind(status_to_string(task.status))
        .bind(&task.blocked_reason)
        .bind(&task.notes)
        .bind(serde_json::to_string(&task.metadata)?)
        .bind(task.archived as i64)
        .bind(task.archived_at)
        .bind(&task.archived_by_initiative_id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(sqlx_error_to_coord_error)?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    /// Persist the full task row. Callers have already applied the archived
    /// guard and metadata merge.
    pub async fn update_task_row(&self, task: &Task) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "UPDATE tasks SET prd_id = ?, parent_id = ?, title = ?, description = ?,
                              assigned_agent = ?, status = ?, blocked_reason = ?, notes = ?,
                              metadata = ?, archived = ?, archived_at = ?,
                              archived_by_initiative_id = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&task.prd_id)
        .bind(&task.parent_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(&task.assigned_agent)
        .bind(status_to_string(task.status))
        .bind(&task.blocked_reason)
        .bind(&task.notes)
        .bind(serde_json::to_string(&task.metadata)?)
        .bind(task.archived as i64)
        .bind(task.archived_at)
        .bind(&task.archived_by_initiative_id)
        .bind(now())
        .bind(&task.id)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1"));

        if let Some(ref prd_id) = filter.prd_id {
            builder.push(" AND prd_id = ");
            builder.push_bind(prd_id);
        }
        if let Some(ref parent_id) = filter.parent_id {
            builder.push(" AND parent_id = ");
            builder.push_bind(parent_id);
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status_to_string(status));
        }
        if let Some(ref agent) = filter.assigned_agent {
            builder.push(" AND assigned_agent = ");
            builder.push_bind(agent);
        }
        if !filter.include_archived {
            builder.push(" AND archived = 0");
        }
        builder.push(" ORDER BY created_at");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }

        let rows = builder
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn subtasks(&self, parent_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = ? ORDER BY created_at"
        ))
        .bind(parent_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_task).collect()
    }

    /// (total, completed) subtask counts for a task.
    pub async fn subtask_counts(&self, parent_id: &str) -> Result<(i64, i64)> {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0)
             FROM tasks WHERE parent_id = ?",
        )
        .bind(parent_id)
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(row)
    }

    /// Map of stream-id to dependency list, built from every non-archived
    /// task carrying stream metadata. First task found per stream wins.
    pub async fn stream_dependency_map(&self) -> Result<HashMap<String, Vec<String>>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE stream_id IS NOT NULL AND archived = 0
             ORDER BY created_at"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;

        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let task = row_to_task(&row)?;
            if let Some(stream_id) = task.stream_id() {
                map.entry(stream_id.to_string())
                    .or_insert_with(|| task.stream_dependencies());
            }
        }
        Ok(map)
    }

    /// Tasks carrying a stream id, optionally scoped by initiative or PRD.
    pub async fn stream_tasks(
        &self,
        initiative_id: Option<&str>,
        prd_id: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<Task>> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE stream_id IS NOT NULL"
        ));
        if let Some(init) = initiative_id {
            builder.push(" AND prd_id IN (SELECT id FROM prds WHERE initiative_id = ");
            builder.push_bind(init);
            builder.push(")");
        }
        if let Some(prd) = prd_id {
            builder.push(" AND prd_id = ");
            builder.push_bind(prd);
        }
        if !include_archived {
            builder.push(" AND archived = 0");
        }
        builder.push(" ORDER BY created_at");

        let rows = builder
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn tasks_by_stream(
        &self,
        stream_id: &str,
        include_archived: bool,
    ) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE stream_id = ?");
        if !include_archived {
            sql.push_str(" AND archived = 0");
        }
        sql.push_str(" ORDER BY created_at");

        let rows = sqlx::query(&sql)
            .bind(stream_id)
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_task).collect()
    }

    /// Non-archived tasks in a conflict-relevant status that declare files.
    pub async fn tasks_declaring_files(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE archived = 0
               AND status IN ('in_progress', 'completed')
               AND json_extract(metadata, '$.files') IS NOT NULL"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_task).collect()
    }

    /// Archive every non-archived task that belongs to any stream, recording
    /// the initiative that was current before the switch. One transaction.
    pub async fn archive_all_stream_tasks(
        &self,
        archived_by_initiative_id: &str,
        archived_at: DateTime<Utc>,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(sqlx_error_to_coord_error)?;
        let updated = sqlx::query(
            "UPDATE tasks SET archived = 1, archived_at = ?, archived_by_initiative_id = ?,
                              updated_at = ?
             WHERE stream_id IS NOT NULL AND archived = 0",
        )
        .bind(archived_at)
        .bind(archived_by_initiative_id)
        .bind(archived_at)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_coord_error)?;
        tx.commit().await.map_err(sqlx_error_to_coord_error)?;
        Ok(updated.rows_affected())
    }

    /// Clear archive markers on every archived task of a stream.
    pub async fn unarchive_stream_tasks(&self, stream_id: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let updated = sqlx::query(
            "UPDATE tasks SET archived = 0, archived_at = NULL,
                              archived_by_initiative_id = NULL, updated_at = ?
             WHERE stream_id = ? AND archived = 1",
        )
        .bind(now())
        .bind(stream_id)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(updated.rows_affected())
    }

    /// Task counts by status for an initiative's PRDs.
    pub async fn task_status_counts(
        &self,
        initiative_id: &str,
    ) -> Result<HashMap<TaskStatus, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tasks
             WHERE archived = 0
               AND prd_id IN (SELECT id FROM prds WHERE initiative_id = ?)
             GROUP BY status",
        )
        .bind(initiative_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            counts.insert(crate::common::string_to_status(&status)?, count as u64);
        }
        Ok(counts)
    }
}

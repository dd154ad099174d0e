use coord_core::{
    error::{CoordError, Result},
    models::{
        ActivityEntry, Handoff, Metadata, PerformanceRecord, Prd, ProtocolViolation, ScopeChange,
        ScopeChangeStatus, Task, WorkProduct,
    },
};

use crate::common::{
    enum_to_json_string, now, row_to_activity, row_to_handoff, row_to_performance, row_to_prd,
    row_to_scope_change, row_to_task, row_to_violation, row_to_work_product,
    sqlx_error_to_coord_error,
};
use crate::store::CoordStore;

/// Everything belonging to one initiative, collected for archive export.
#[derive(Debug, Clone)]
pub struct InitiativeSnapshot {
    pub prds: Vec<Prd>,
    pub tasks: Vec<Task>,
    pub work_products: Vec<WorkProduct>,
    pub activity_log: Vec<ActivityEntry>,
}

impl CoordStore {
    // Work products (append-only per task)

    pub async fn insert_work_product(&self, product: &WorkProduct) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO work_products (id, task_id, product_type, title, content, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&product.id)
        .bind(&product.task_id)
        .bind(product.product_type.to_string())
        .bind(&product.title)
        .bind(&product.content)
        .bind(serde_json::to_string(&product.metadata)?)
        .bind(product.created_at)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    pub async fn get_work_product(&self, id: &str) -> Result<Option<WorkProduct>> {
        let row = sqlx::query("SELECT * FROM work_products WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(sqlx_error_to_coord_error)?;
        row.map(|r| row_to_work_product(&r)).transpose()
    }

    pub async fn list_work_products(&self, task_id: &str) -> Result<Vec<WorkProduct>> {
        let rows =
            sqlx::query("SELECT * FROM work_products WHERE task_id = ? ORDER BY created_at, id")
                .bind(task_id)
                .fetch_all(self.pool())
                .await
                .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_work_product).collect()
    }

    pub async fn has_work_products(&self, task_id: &str) -> Result<bool> {
        let (exists,): (i64,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM work_products WHERE task_id = ?)")
                .bind(task_id)
                .fetch_one(self.pool())
                .await
                .map_err(sqlx_error_to_coord_error)?;
        Ok(exists != 0)
    }

    /// Latest work product for a task, for content-predicate rules.
    pub async fn latest_work_product(&self, task_id: &str) -> Result<Option<WorkProduct>> {
        let row = sqlx::query(
            "SELECT * FROM work_products WHERE task_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        row.map(|r| row_to_work_product(&r)).transpose()
    }

    // Handoffs

    pub async fn insert_handoff(&self, handoff: &Handoff) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO handoffs (id, task_id, from_agent, to_agent, work_product_id,
                                   handoff_context, chain_position, chain_length, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&handoff.id)
        .bind(&handoff.task_id)
        .bind(&handoff.from_agent)
        .bind(&handoff.to_agent)
        .bind(&handoff.work_product_id)
        .bind(&handoff.handoff_context)
        .bind(handoff.chain_position as i64)
        .bind(handoff.chain_length as i64)
        .bind(handoff.created_at)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    /// Handoffs for a task in chain-position order.
    pub async fn list_handoffs(&self, task_id: &str) -> Result<Vec<Handoff>> {
        let rows =
            sqlx::query("SELECT * FROM handoffs WHERE task_id = ? ORDER BY chain_position")
                .bind(task_id)
                .fetch_all(self.pool())
                .await
                .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_handoff).collect()
    }

    // Scope changes

    pub async fn insert_scope_change(&self, change: &ScopeChange) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO scope_changes (id, prd_id, request_type, description, rationale,
                                        requested_by, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&change.id)
        .bind(&change.prd_id)
        .bind(change.request_type.to_string())
        .bind(&change.description)
        .bind(&change.rationale)
        .bind(&change.requested_by)
        .bind(change.status.to_string())
        .bind(change.created_at)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    pub async fn get_scope_change(&self, id: &str) -> Result<Option<ScopeChange>> {
        let row = sqlx::query("SELECT * FROM scope_changes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(sqlx_error_to_coord_error)?;
        row.map(|r| row_to_scope_change(&r)).transpose()
    }

    pub async fn record_scope_change_review(
        &self,
        id: &str,
        status: ScopeChangeStatus,
        reviewed_by: &str,
        review_notes: Option<&str>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let updated = sqlx::query(
            "UPDATE scope_changes SET status = ?, reviewed_at = ?, reviewed_by = ?, review_notes = ?
             WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(now())
        .bind(reviewed_by)
        .bind(review_notes)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        if updated.rows_affected() == 0 {
            return Err(CoordError::not_found("Scope change", id));
        }
        Ok(())
    }

    pub async fn list_scope_changes(
        &self,
        prd_id: Option<&str>,
        status: Option<ScopeChangeStatus>,
    ) -> Result<Vec<ScopeChange>> {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT * FROM scope_changes WHERE 1=1");
        if let Some(prd) = prd_id {
            builder.push(" AND prd_id = ");
            builder.push_bind(prd);
        }
        if let Some(status) = status {
            builder.push(" AND status = ");
            builder.push_bind(status.to_string());
        }
        builder.push(" ORDER BY created_at");
        let rows = builder
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_scope_change).collect()
    }

    // Activity log

    pub async fn append_activity(
        &self,
        initiative_id: &str,
        entity_type: &str,
        entity_id: &str,
        action: &str,
        summary: &str,
        metadata: &Metadata,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO activity_log (initiative_id, entity_type, entity_id, action, summary,
                                       metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(initiative_id)
        .bind(entity_type)
        .bind(entity_id)
        .bind(action)
        .bind(summary)
        .bind(serde_json::to_string(metadata)?)
        .bind(now())
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    pub async fn list_activity(
        &self,
        initiative_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ActivityEntry>> {
        let rows = match initiative_id {
            Some(init) => {
                sqlx::query(
                    "SELECT * FROM activity_log WHERE initiative_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(init)
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query("SELECT * FROM activity_log ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await
            }
        }
        .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_activity).collect()
    }

    // Performance records

    pub async fn insert_performance(&self, record: &PerformanceRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO performance_records (id, agent_id, task_id, work_product_type,
                                              complexity, outcome, duration_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.agent_id)
        .bind(&record.task_id)
        .bind(record.work_product_type.as_ref().map(|t| t.to_string()))
        .bind(&record.complexity)
        .bind(record.outcome.to_string())
        .bind(record.duration_ms)
        .bind(record.created_at)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    pub async fn list_performance(&self, agent_id: &str) -> Result<Vec<PerformanceRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM performance_records WHERE agent_id = ? ORDER BY created_at DESC",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_performance).collect()
    }

    // Protocol violations

    pub async fn insert_violation(&self, violation: &ProtocolViolation) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO protocol_violations (id, session_id, initiative_id, violation_type,
                                              severity, context, suggestion, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&violation.id)
        .bind(&violation.session_id)
        .bind(&violation.initiative_id)
        .bind(&violation.violation_type)
        .bind(enum_to_json_string(&violation.severity))
        .bind(
            violation
                .context
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&violation.suggestion)
        .bind(violation.created_at)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    pub async fn list_violations(
        &self,
        session_id: Option<&str>,
        initiative_id: Option<&str>,
    ) -> Result<Vec<ProtocolViolation>> {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT * FROM protocol_violations WHERE 1=1");
        if let Some(session) = session_id {
            builder.push(" AND session_id = ");
            builder.push_bind(session);
        }
        if let Some(init) = initiative_id {
            builder.push(" AND initiative_id = ");
            builder.push_bind(init);
        }
        builder.push(" ORDER BY created_at");
        let rows = builder
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_violation).collect()
    }

    // Initiative archive / wipe

    /// Collect every dependent row of an initiative for archive export.
    pub async fn collect_initiative(&self, initiative_id: &str) -> Result<InitiativeSnapshot> {
        let prds = self.list_prds(Some(initiative_id)).await?;

        let task_rows = sqlx::query(
            "SELECT id, prd_id, parent_id, title, description, assigned_agent, status,
                    blocked_reason, notes, metadata, archived, archived_at,
                    archived_by_initiative_id, created_at, updated_at
             FROM tasks
             WHERE prd_id IN (SELECT id FROM prds WHERE initiative_id = ?)
             ORDER BY created_at",
        )
        .bind(initiative_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        let tasks: Vec<Task> = task_rows
            .iter()
            .map(row_to_task)
            .collect::<Result<Vec<_>>>()?;

        let wp_rows = sqlx::query(
            "SELECT * FROM work_products
             WHERE task_id IN (SELECT id FROM tasks
                               WHERE prd_id IN (SELECT id FROM prds WHERE initiative_id = ?))
             ORDER BY created_at",
        )
        .bind(initiative_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        let work_products = wp_rows
            .iter()
            .map(row_to_work_product)
            .collect::<Result<Vec<_>>>()?;

        let activity_log = self.list_activity(Some(initiative_id), u32::MAX).await?;

        Ok(InitiativeSnapshot {
            prds,
            tasks,
            work_products,
            activity_log,
        })
    }

    /// Delete every dependent row of an initiative, leaving the initiative
    /// row itself. One transaction; rollback on any failure.
    pub async fn delete_initiative_dependents(&self, initiative_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(sqlx_error_to_coord_error)?;

        let task_subquery =
            "SELECT id FROM tasks WHERE prd_id IN (SELECT id FROM prds WHERE initiative_id = ?)";

        for table in ["checkpoints", "handoffs", "work_products"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE task_id IN ({task_subquery})"
            ))
            .bind(initiative_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_coord_error)?;
        }

        sqlx::query(&format!("DELETE FROM tasks WHERE id IN ({task_subquery})"))
            .bind(initiative_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_coord_error)?;

        sqlx::query(
            "DELETE FROM scope_changes
             WHERE prd_id IN (SELECT id FROM prds WHERE initiative_id = ?)",
        )
        .bind(initiative_id)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_coord_error)?;

        sqlx::query("DELETE FROM prds WHERE initiative_id = ?")
            .bind(initiative_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_coord_error)?;

        sqlx::query("DELETE FROM activity_log WHERE initiative_id = ?")
            .bind(initiative_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_coord_error)?;

        tx.commit().await.map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }
}

use chrono::{DateTime, Utc};
use coord_core::{
    error::Result,
    models::{Checkpoint, IterationHistoryEntry},
};
use serde_json::Value;

use crate::common::{
    row_to_checkpoint, sqlx_error_to_coord_error, status_to_string, trigger_to_string,
};
use crate::store::CoordStore;

/// Maximum checkpoints retained per task; the oldest beyond this are pruned
/// at creation time. Only the newest iteration checkpoint is skipped, so an
/// in-flight loop keeps its state; iteration checkpoints superseded by a
/// later loop prune like any other row.
pub const MAX_CHECKPOINTS_PER_TASK: i64 = 5;

impl CoordStore {
    /// Insert a checkpoint, assigning the next sequence for its task and
    /// pruning the oldest surplus snapshots, all in one transaction.
    pub async fn insert_checkpoint(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(sqlx_error_to_coord_error)?;

        let (next_sequence,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM checkpoints WHERE task_id = ?",
        )
        .bind(&checkpoint.task_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(sqlx_error_to_coord_error)?;
        checkpoint.sequence = next_sequence;

        sqlx::query(
            "INSERT INTO checkpoints (id, task_id, sequence, trigger_kind, task_status,
                 task_notes, task_metadata, blocked_reason, assigned_agent, execution_phase,
                 execution_step, agent_context, draft_content, draft_type, subtask_states,
                 iteration_config, iteration_number, iteration_history, validation_state,
                 created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.task_id)
        .bind(checkpoint.sequence)
        .bind(trigger_to_string(checkpoint.trigger))
        .bind(status_to_string(checkpoint.task_status))
        .bind(&checkpoint.task_notes)
        .bind(serde_json::to_string(&checkpoint.task_metadata)?)
        .bind(&checkpoint.blocked_reason)
        .bind(&checkpoint.assigned_agent)
        .bind(&checkpoint.execution_phase)
        .bind(&checkpoint.execution_step)
        .bind(
            checkpoint
                .agent_context
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&checkpoint.draft_content)
        .bind(&checkpoint.draft_type)
        .bind(serde_json::to_string(&checkpoint.subtask_states)?)
        .bind(
            checkpoint
                .iteration_config
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(checkpoint.iteration_number.map(|n| n as i64))
        .bind(serde_json::to_string(&checkpoint.iteration_history)?)
        .bind(
            checkpoint
                .validation_state
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(checkpoint.created_at)
        .bind(checkpoint.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error_to_coord_error)?;

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM checkpoints WHERE task_id = ?")
                .bind(&checkpoint.task_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(sqlx_error_to_coord_error)?;

        if count > MAX_CHECKPOINTS_PER_TASK {
            let surplus = count - MAX_CHECKPOINTS_PER_TASK;
            // Every row except the newest iteration checkpoint is a prune
            // candidate; surplus <= candidate count always holds, so the
            // per-task total never exceeds the cap.
            sqlx::query(
                "DELETE FROM checkpoints WHERE id IN (
                     SELECT id FROM checkpoints
                     WHERE task_id = ?1
                       AND id NOT IN (
                           SELECT id FROM checkpoints
                           WHERE task_id = ?1 AND iteration_config IS NOT NULL
                           ORDER BY sequence DESC LIMIT 1)
                     ORDER BY sequence ASC LIMIT ?2)",
            )
            .bind(&checkpoint.task_id)
            .bind(surplus)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_coord_error)?;
        }

        tx.commit().await.map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    pub async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(sqlx_error_to_coord_error)?;
        row.map(|r| row_to_checkpoint(&r)).transpose()
    }

    pub async fn latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE task_id = ? ORDER BY sequence DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        row.map(|r| row_to_checkpoint(&r)).transpose()
    }

    /// Checkpoints for a task, newest first.
    pub async fn list_checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query("SELECT * FROM checkpoints WHERE task_id = ? ORDER BY sequence DESC")
            .bind(task_id)
            .fetch_all(self.pool())
            .await
            .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    /// Update the live iteration fields on an iteration checkpoint.
    pub async fn update_iteration_state(
        &self,
        checkpoint_id: &str,
        iteration_number: u32,
        history: &[IterationHistoryEntry],
        validation_state: Option<&Value>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "UPDATE checkpoints SET iteration_number = ?, iteration_history = ?,
                                    validation_state = ?
             WHERE id = ?",
        )
        .bind(iteration_number as i64)
        .bind(serde_json::to_string(history)?)
        .bind(validation_state.map(serde_json::to_string).transpose()?)
        .bind(checkpoint_id)
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    pub async fn delete_expired_checkpoints(&self, now: DateTime<Utc>) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let deleted =
            sqlx::query("DELETE FROM checkpoints WHERE expires_at IS NOT NULL AND expires_at < ?")
                .bind(now)
                .execute(self.pool())
                .await
                .map_err(sqlx_error_to_coord_error)?;
        Ok(deleted.rows_affected())
    }

    /// Delete checkpoints created before the cutoff, optionally scoped to
    /// one task. Cutoff deletion is an explicit request and spares nothing,
    /// iteration checkpoints included.
    pub async fn delete_checkpoints_older_than(
        &self,
        cutoff: DateTime<Utc>,
        task_id: Option<&str>,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let deleted = match task_id {
            Some(task) => {
                sqlx::query("DELETE FROM checkpoints WHERE created_at < ? AND task_id = ?")
                    .bind(cutoff)
                    .bind(task)
                    .execute(self.pool())
                    .await
            }
            None => {
                sqlx::query("DELETE FROM checkpoints WHERE created_at < ?")
                    .bind(cutoff)
                    .execute(self.pool())
                    .await
            }
        }
        .map_err(sqlx_error_to_coord_error)?;
        Ok(deleted.rows_affected())
    }

    /// Keep only the `keep` newest checkpoints for a task.
    pub async fn retain_latest_checkpoints(&self, task_id: &str, keep: i64) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let deleted = sqlx::query(
            "DELETE FROM checkpoints WHERE task_id = ? AND id NOT IN (
                 SELECT id FROM checkpoints WHERE task_id = ?
                 ORDER BY sequence DESC LIMIT ?)",
        )
        .bind(task_id)
        .bind(task_id)
        .bind(keep.max(0))
        .execute(self.pool())
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(deleted.rows_affected())
    }

    pub async fn count_checkpoints(&self, task_id: Option<&str>) -> Result<i64> {
        let (count,): (i64,) = match task_id {
            Some(task) => {
                sqlx::query_as("SELECT COUNT(*) FROM checkpoints WHERE task_id = ?")
                    .bind(task)
                    .fetch_one(self.pool())
                    .await
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM checkpoints")
                    .fetch_one(self.pool())
                    .await
            }
        }
        .map_err(sqlx_error_to_coord_error)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_core::models::{
        CheckpointTrigger, IterationConfig, Metadata, Task, TaskStatus,
    };

    async fn store_with_task() -> CoordStore {
        let store = CoordStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
            .insert_task(&Task {
                id: "TASK-1".into(),
                prd_id: None,
                parent_id: None,
                title: "Task".into(),
                description: String::new(),
                assigned_agent: None,
                status: TaskStatus::Pending,
                blocked_reason: None,
                notes: None,
                metadata: Metadata::new(),
                archived: false,
                archived_at: None,
                archived_by_initiative_id: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store
    }

    fn make_checkpoint(id: &str) -> Checkpoint {
        Checkpoint {
            id: id.into(),
            task_id: "TASK-1".into(),
            sequence: 0,
            trigger: CheckpointTrigger::Manual,
            task_status: TaskStatus::Pending,
            task_notes: None,
            task_metadata: Metadata::new(),
            blocked_reason: None,
            assigned_agent: None,
            execution_phase: None,
            execution_step: None,
            agent_context: None,
            draft_content: None,
            draft_type: None,
            subtask_states: vec![],
            iteration_config: None,
            iteration_number: None,
            iteration_history: vec![],
            validation_state: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_sequence_assignment_and_pruning() {
        let store = store_with_task().await;
        for i in 1..=7 {
            let mut cp = make_checkpoint(&format!("CP-{i}"));
            store.insert_checkpoint(&mut cp).await.unwrap();
            assert_eq!(cp.sequence, i);
        }

        let remaining = store.list_checkpoints("TASK-1").await.unwrap();
        assert_eq!(remaining.len(), 5);
        let sequences: Vec<i64> = remaining.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![7, 6, 5, 4, 3]);
        assert!(store.get_checkpoint("CP-1").await.unwrap().is_none());
        assert!(store.get_checkpoint("CP-2").await.unwrap().is_none());
    }

    fn make_iteration_checkpoint(id: &str) -> Checkpoint {
        let mut cp = make_checkpoint(id);
        cp.iteration_config = Some(IterationConfig {
            max_iterations: 3,
            completion_promises: vec!["<promise>COMPLETE</promise>".into()],
            validation_rules: vec![],
            circuit_breaker_threshold: 3,
        });
        cp.iteration_number = Some(1);
        cp
    }

    #[tokio::test]
    async fn test_live_iteration_checkpoint_survives_pruning() {
        let store = store_with_task().await;
        let mut iteration_cp = make_iteration_checkpoint("IT-1");
        store.insert_checkpoint(&mut iteration_cp).await.unwrap();

        for i in 1..=7 {
            let mut cp = make_checkpoint(&format!("CP-{i}"));
            store.insert_checkpoint(&mut cp).await.unwrap();
        }

        // The loop state survives, but the cap still holds
        assert!(store.get_checkpoint("IT-1").await.unwrap().is_some());
        assert_eq!(store.count_checkpoints(Some("TASK-1")).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_superseded_iteration_checkpoints_prune_like_any_row() {
        let store = store_with_task().await;
        for i in 1..=7 {
            let mut cp = make_iteration_checkpoint(&format!("IT-{i}"));
            store.insert_checkpoint(&mut cp).await.unwrap();
            assert!(store.count_checkpoints(Some("TASK-1")).await.unwrap() <= 5);
        }

        // Newest loop retained, the two oldest superseded loops pruned
        assert!(store.get_checkpoint("IT-7").await.unwrap().is_some());
        assert!(store.get_checkpoint("IT-1").await.unwrap().is_none());
        assert!(store.get_checkpoint("IT-2").await.unwrap().is_none());
        assert_eq!(store.count_checkpoints(Some("TASK-1")).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_expiry_and_retention_cleanup() {
        let store = store_with_task().await;
        let mut expired = make_checkpoint("CP-old");
        expired.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.insert_checkpoint(&mut expired).await.unwrap();

        let mut live = make_checkpoint("CP-live");
        live.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.insert_checkpoint(&mut live).await.unwrap();

        assert_eq!(store.delete_expired_checkpoints(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.count_checkpoints(Some("TASK-1")).await.unwrap(), 1);

        // Retention keeps the newest
        let mut cp = make_checkpoint("CP-extra");
        store.insert_checkpoint(&mut cp).await.unwrap();
        let deleted = store.retain_latest_checkpoints("TASK-1", 1).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_checkpoint("CP-extra").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_iteration_state() {
        let store = store_with_task().await;
        let mut cp = make_checkpoint("IT-1");
        cp.iteration_config = Some(IterationConfig {
            max_iterations: 3,
            completion_promises: vec!["done".into()],
            validation_rules: vec![],
            circuit_breaker_threshold: 3,
        });
        cp.iteration_number = Some(1);
        store.insert_checkpoint(&mut cp).await.unwrap();

        let history = vec![IterationHistoryEntry {
            iteration: 1,
            timestamp: Utc::now(),
            validation_passed: Some(false),
            checkpoint_id: None,
        }];
        store
            .update_iteration_state("IT-1", 2, &history, Some(&serde_json::json!({"ok": false})))
            .await
            .unwrap();

        let loaded = store.get_checkpoint("IT-1").await.unwrap().unwrap();
        assert_eq!(loaded.iteration_number, Some(2));
        assert_eq!(loaded.iteration_history.len(), 1);
        assert!(loaded.validation_state.is_some());
    }
}

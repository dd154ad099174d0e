use coord_core::{
    error::{CoordError, Result},
    models::{Initiative, Metadata, Prd, PrdStatus},
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::common::{now, row_to_initiative, row_to_prd, sqlx_error_to_coord_error};

const CURRENT_INITIATIVE_KEY: &str = "current_initiative";

/// Embedded single-file relational store.
///
/// Single-writer model: every mutating path serializes through one mutex
/// around its transaction boundary; readers run lock-free under SQLite
/// snapshot semantics (WAL for file databases).
pub struct CoordStore {
    pool: SqlitePool,
    pub(crate) write_lock: Mutex<()>,
}

impl CoordStore {
    /// Open (creating if needed) the store at the given path.
    pub async fn open(database_path: &str) -> Result<Self> {
        let path = database_path.trim_start_matches("sqlite://");

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(sqlx_error_to_coord_error)?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// In-memory store for tests. A single connection keeps every reader on
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(sqlx_error_to_coord_error)?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Apply pending migrations. Forward-only, idempotent, transactional.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoordError::Store(format!("Migration failed: {e}")))?;
        tracing::info!("Store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    // Workspace meta

    pub async fn current_initiative_id(&self) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM workspace_meta WHERE key = ?")
                .bind(CURRENT_INITIATIVE_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(sqlx_error_to_coord_error)?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_current_initiative(&self, initiative_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO workspace_meta (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(CURRENT_INITIATIVE_KEY)
        .bind(initiative_id)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    // Initiatives

    /// Insert a new initiative or refresh an existing one's title and
    /// description. Initiatives are never deleted.
    pub async fn upsert_initiative(
        &self,
        id: &str,
        title: &str,
        description: &str,
    ) -> Result<Initiative> {
        let _guard = self.write_lock.lock().await;
        let ts = now();
        let row = sqlx::query(
            "INSERT INTO initiatives (id, title, description, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 description = excluded.description,
                 updated_at = excluded.updated_at
             RETURNING id, title, description, created_at, updated_at",
        )
        .bind(id)
        .bind(title)
        .bind(description)
        .bind(ts)
        .bind(ts)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_coord_error)?;

        row_to_initiative(&row)
    }

    pub async fn get_initiative(&self, id: &str) -> Result<Option<Initiative>> {
        let row = sqlx::query(
            "SELECT id, title, description, created_at, updated_at FROM initiatives WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_coord_error)?;
        row.map(|r| row_to_initiative(&r)).transpose()
    }

    // PRDs

    pub async fn insert_prd(&self, prd: &Prd) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO prds (id, initiative_id, title, description, content, prd_type,
                               scope_locked, status, metadata, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&prd.id)
        .bind(&prd.initiative_id)
        .bind(&prd.title)
        .bind(&prd.description)
        .bind(&prd.content)
        .bind(prd.prd_type.to_string())
        .bind(prd.scope_locked as i64)
        .bind(prd.status.to_string())
        .bind(serde_json::to_string(&prd.metadata)?)
        .bind(prd.created_at)
        .bind(prd.updated_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_coord_error)?;
        Ok(())
    }

    pub async fn get_prd(&self, id: &str) -> Result<Option<Prd>> {
        let row = sqlx::query("SELECT * FROM prds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_coord_error)?;
        row.map(|r| row_to_prd(&r)).transpose()
    }

    pub async fn list_prds(&self, initiative_id: Option<&str>) -> Result<Vec<Prd>> {
        let rows = match initiative_id {
            Some(init) => {
                sqlx::query("SELECT * FROM prds WHERE initiative_id = ? ORDER BY created_at")
                    .bind(init)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM prds ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(sqlx_error_to_coord_error)?;
        rows.iter().map(row_to_prd).collect()
    }

    pub async fn set_prd_status(&self, id: &str, status: PrdStatus) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let updated = sqlx::query("UPDATE prds SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_coord_error)?;
        if updated.rows_affected() == 0 {
            return Err(CoordError::not_found("PRD", id));
        }
        Ok(())
    }

    pub async fn update_prd_metadata(&self, id: &str, metadata: &Metadata) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let updated = sqlx::query("UPDATE prds SET metadata = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(metadata)?)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_coord_error)?;
        if updated.rows_affected() == 0 {
            return Err(CoordError::not_found("PRD", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> CoordStore {
        let store = CoordStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_open_and_health() {
        let store = test_store().await;
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_current_initiative_round_trip() {
        let store = test_store().await;
        assert_eq!(store.current_initiative_id().await.unwrap(), None);

        store.set_current_initiative("INIT-001").await.unwrap();
        assert_eq!(
            store.current_initiative_id().await.unwrap(),
            Some("INIT-001".to_string())
        );

        store.set_current_initiative("INIT-002").await.unwrap();
        assert_eq!(
            store.current_initiative_id().await.unwrap(),
            Some("INIT-002".to_string())
        );
    }

    #[tokio::test]
    async fn test_initiative_upsert_keeps_created_at() {
        let store = test_store().await;
        let first = store
            .upsert_initiative("INIT-001", "First", "desc")
            .await
            .unwrap();
        let second = store
            .upsert_initiative("INIT-001", "Renamed", "desc2")
            .await
            .unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.title, "Renamed");
    }
}

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use super::{InstanceStore, StoreError};
use crate::{now_millis, InstanceRecord, InstanceStatus};

/// SQLite-backed instance store.
///
/// Status changes are single conditional UPDATE statements, so the
/// compare-and-swap guarantee holds across every process sharing the
/// database file.
pub struct SqliteInstanceStore {
    pool: SqlitePool,
}

impl SqliteInstanceStore {
    /// Open a store at `database_url` (e.g. "sqlite:instances.db") and
    /// create the schema if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        // In-memory DBs don't need durability
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        // WAL for concurrent readers alongside the writer
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    // Retry on locks instead of failing immediately
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Shared-cache in-memory store so multiple pooled connections see the
    /// same database. For tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:?cache=shared").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                result TEXT,
                attempt INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Recovery scans filter on status
        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status)"#)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Convert a sqlx error into a StoreError with retry classification.
    fn sqlx_to_store_error(operation: &str, e: sqlx::Error) -> StoreError {
        let message = e.to_string();

        if message.contains("database is locked") || message.contains("SQLITE_BUSY") {
            return StoreError::retryable(operation, format!("database locked: {message}"));
        }
        if message.contains("UNIQUE constraint") || message.contains("PRIMARY KEY") {
            return StoreError::permanent(operation, format!("constraint violation: {message}"));
        }
        if message.contains("connection") || message.contains("timeout") {
            return StoreError::retryable(operation, format!("connection error: {message}"));
        }

        // Default: treat as retryable (conservative)
        StoreError::retryable(operation, message)
    }

    fn row_to_record(row: &SqliteRow) -> Result<InstanceRecord, StoreError> {
        let col = |e: sqlx::Error| StoreError::permanent("row_to_record", e.to_string());

        let status_text: String = row.try_get("status").map_err(col)?;
        let status = InstanceStatus::parse(&status_text)
            .ok_or_else(|| StoreError::permanent("row_to_record", format!("unknown status: {status_text}")))?;

        Ok(InstanceRecord {
            id: row.try_get("instance_id").map_err(col)?,
            status,
            input: row.try_get("input").map_err(col)?,
            result: row.try_get("result").map_err(col)?,
            attempt: row.try_get::<i64, _>("attempt").map_err(col)? as u32,
            created_at_ms: row.try_get::<i64, _>("created_at").map_err(col)? as u64,
            completed_at_ms: row
                .try_get::<Option<i64>, _>("completed_at")
                .map_err(col)?
                .map(|v| v as u64),
        })
    }

    /// Classify a zero-row conditional UPDATE: either the instance is gone or
    /// another writer holds a different status.
    async fn conflict_for(&self, id: &str, expected: InstanceStatus) -> StoreError {
        match self.get(id).await {
            Ok(None) => StoreError::NotFound { id: id.to_string() },
            Ok(Some(actual)) => StoreError::Conflict {
                id: id.to_string(),
                expected,
                actual: actual.status,
            },
            Err(e) => e,
        }
    }
}

#[async_trait::async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn create(&self, record: InstanceRecord) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO instances (instance_id, status, input, result, attempt, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(instance_id) DO NOTHING
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.status.as_str())
        .bind(record.input.as_str())
        .bind(record.result.as_deref())
        .bind(record.attempt as i64)
        .bind(record.created_at_ms as i64)
        .bind(record.completed_at_ms.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("create", e))?;

        if res.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists { id: record.id });
        }
        debug!(target: "longrun::store::sqlite", instance = %record.id, "created instance record");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM instances WHERE instance_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("get", e))?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn transition(
        &self,
        id: &str,
        expected: InstanceStatus,
        next: InstanceStatus,
        result: Option<String>,
    ) -> Result<(), StoreError> {
        if !expected.can_advance_to(next) {
            return Err(StoreError::permanent(
                "transition",
                format!("illegal transition {expected} -> {next}"),
            ));
        }
        let completed_at = if next.is_terminal() {
            Some(now_millis() as i64)
        } else {
            None
        };
        let res = sqlx::query(
            r#"
            UPDATE instances
            SET status = ?, result = COALESCE(?, result), completed_at = COALESCE(?, completed_at)
            WHERE instance_id = ? AND status = ?
            "#,
        )
        .bind(next.as_str())
        .bind(result.as_deref())
        .bind(completed_at)
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("transition", e))?;

        if res.rows_affected() == 0 {
            return Err(self.conflict_for(id, expected).await);
        }
        debug!(target: "longrun::store::sqlite", instance = %id, from = %expected, to = %next, "status transition");
        Ok(())
    }

    async fn record_attempt(&self, id: &str, attempt: u32) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE instances SET attempt = ? WHERE instance_id = ? AND status = ?")
            .bind(attempt as i64)
            .bind(id)
            .bind(InstanceStatus::Running.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("record_attempt", e))?;

        if res.rows_affected() == 0 {
            return Err(self.conflict_for(id, InstanceStatus::Running).await);
        }
        Ok(())
    }

    async fn list_non_terminal(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM instances WHERE status IN (?, ?) ORDER BY created_at")
            .bind(InstanceStatus::Pending.as_str())
            .bind(InstanceStatus::Running.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("list_non_terminal", e))?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn reset(&self) {
        let _ = sqlx::query("DELETE FROM instances").execute(&self.pool).await;
    }
}

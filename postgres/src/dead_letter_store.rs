//! Durable dead letter store.
//!
//! Keeps messages that exhausted their handling options, with enough context
//! for incident investigation and manual replay.

use chrono::{DateTime, Utc};
use marketplace_events_runtime::dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterSink, DeadLetterStatus, SinkFuture,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Table holding dead letters.
pub const TABLE: &str = "dead_letter_messages";

/// DDL for the dead letter table. Idempotent.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS dead_letter_messages (
    id UUID PRIMARY KEY,
    message_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    error_kind TEXT NOT NULL,
    error_message TEXT NOT NULL,
    handler_type TEXT NOT NULL,
    source_queue TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    failed_at TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    resolved_at TIMESTAMPTZ,
    resolved_by TEXT,
    resolution_notes TEXT
);
CREATE INDEX IF NOT EXISTS idx_dead_letter_messages_status
    ON dead_letter_messages (status, failed_at);
CREATE INDEX IF NOT EXISTS idx_dead_letter_messages_source_queue
    ON dead_letter_messages (source_queue);
";

const SELECT_COLUMNS: &str = "
    SELECT id, message_type, payload, error_kind, error_message, handler_type,
           source_queue, attempt_count, failed_at, status,
           resolved_at, resolved_by, resolution_notes
    FROM dead_letter_messages";

fn storage(err: &sqlx::Error) -> DeadLetterError {
    DeadLetterError::Storage(err.to_string())
}

/// `PostgreSQL`-backed [`DeadLetterSink`].
///
/// # Example
///
/// ```no_run
/// use marketplace_events_postgres::PostgresDeadLetterStore;
/// use marketplace_events_runtime::DeadLetterStatus;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresDeadLetterStore::connect("postgres://localhost/marketplace").await?;
/// store.ensure_schema().await?;
///
/// let pending = store.list_pending(100).await?;
/// if let Some(entry) = pending.first() {
///     store.update_status(entry.id, DeadLetterStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    /// Store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a small pool on `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the database is unreachable.
    pub async fn connect(database_url: &str) -> Result<Self, DeadLetterError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| storage(&e))?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), DeadLetterError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| storage(&e))?;
        Ok(())
    }

    /// Insert `entry`. Storing the same entry id twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the insert fails.
    pub async fn insert(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        let attempt_count = i32::try_from(entry.attempt_count).unwrap_or(i32::MAX);

        sqlx::query(
            r"
            INSERT INTO dead_letter_messages (
                id, message_type, payload, error_kind, error_message, handler_type,
                source_queue, attempt_count, failed_at, status,
                resolved_at, resolved_by, resolution_notes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(entry.id)
        .bind(&entry.message_type)
        .bind(&entry.payload)
        .bind(&entry.error_kind)
        .bind(&entry.error_message)
        .bind(&entry.handler_type)
        .bind(&entry.source_queue)
        .bind(attempt_count)
        .bind(entry.failed_at)
        .bind(entry.status.as_str())
        .bind(entry.resolved_at)
        .bind(entry.resolved_by.as_deref())
        .bind(entry.resolution_notes.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| storage(&e))?;

        tracing::warn!(
            dlq_id = %entry.id,
            message_type = %entry.message_type,
            source_queue = %entry.source_queue,
            error_kind = %entry.error_kind,
            attempt_count = entry.attempt_count,
            "Message added to dead letter store"
        );

        let message_type = entry.message_type.clone();
        metrics::counter!("dead_letter_store_added_total", "message_type" => message_type)
            .increment(1);

        Ok(())
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_pending(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.list_by_status(DeadLetterStatus::Pending, limit).await
    }

    /// Entries with `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails, or
    /// [`DeadLetterError::InvalidStatus`] for a corrupt row.
    pub async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = $1 ORDER BY failed_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(&e))?;

        rows.iter().map(row_to_entry).collect()
    }

    /// One entry, if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage(&e))?;

        row.as_ref().map(row_to_entry).transpose()
    }

    /// Move an entry to `status`.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: DeadLetterStatus,
    ) -> Result<(), DeadLetterError> {
        sqlx::query("UPDATE dead_letter_messages SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage(&e))?;

        tracing::info!(dlq_id = %id, status = status.as_str(), "Dead letter status updated");
        Ok(())
    }

    /// Mark an entry replayed successfully.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE dead_letter_messages
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage(&e))?;

        tracing::info!(dlq_id = %id, resolved_by, "Dead letter marked as resolved");
        metrics::counter!("dead_letter_store_resolved_total").increment(1);
        Ok(())
    }

    /// Give up on an entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_discarded(&self, id: Uuid, reason: &str) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE dead_letter_messages
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage(&e))?;

        tracing::warn!(dlq_id = %id, reason, "Dead letter marked as discarded");
        metrics::counter!("dead_letter_store_discarded_total").increment(1);
        Ok(())
    }

    /// Number of pending entries, for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn count_pending(&self) -> Result<u64, DeadLetterError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letter_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| storage(&e))?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl DeadLetterSink for PostgresDeadLetterStore {
    fn store<'a>(&'a self, entry: &'a DeadLetterEntry) -> SinkFuture<'a> {
        Box::pin(self.insert(entry))
    }
}

fn row_to_entry(row: &PgRow) -> Result<DeadLetterEntry, DeadLetterError> {
    let status: String = row.try_get("status").map_err(|e| storage(&e))?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(|e| storage(&e))?;
    let failed_at: DateTime<Utc> = row.try_get("failed_at").map_err(|e| storage(&e))?;

    Ok(DeadLetterEntry {
        id: row.try_get("id").map_err(|e| storage(&e))?,
        message_type: row.try_get("message_type").map_err(|e| storage(&e))?,
        payload: row.try_get("payload").map_err(|e| storage(&e))?,
        error_kind: row.try_get("error_kind").map_err(|e| storage(&e))?,
        error_message: row.try_get("error_message").map_err(|e| storage(&e))?,
        handler_type: row.try_get("handler_type").map_err(|e| storage(&e))?,
        source_queue: row.try_get("source_queue").map_err(|e| storage(&e))?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(0),
        failed_at,
        status: status.parse()?,
        resolved_at: row.try_get("resolved_at").map_err(|e| storage(&e))?,
        resolved_by: row.try_get("resolved_by").map_err(|e| storage(&e))?,
        resolution_notes: row.try_get("resolution_notes").map_err(|e| storage(&e))?,
    })
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::backend::StorageBackend;
use crate::core::{EventRecord, TrackedEventRecord};
use crate::error::{ErrorClassifier, ErrorKind};

// ============================================================================
// PostgreSQL Storage Backend
// ============================================================================
//
// Global positions come from a BIGSERIAL column: assignment happens inside the
// database, so it stays correct under multi-process concurrency. The unique
// index on (aggregate_id, sequence_number) is the optimistic-concurrency
// check: a losing writer hits SQLSTATE 23505 and the classifier turns that
// into a concurrency conflict.
//
// ============================================================================

const CREATE_EVENTS_TABLE: &str = "CREATE TABLE IF NOT EXISTS domain_events (
    global_position  BIGSERIAL PRIMARY KEY,
    aggregate_type   TEXT NOT NULL,
    aggregate_id     TEXT NOT NULL,
    sequence_number  BIGINT NOT NULL,
    event_id         TEXT NOT NULL,
    event_timestamp  TIMESTAMPTZ NOT NULL,
    payload_type     TEXT NOT NULL,
    payload_revision TEXT,
    payload          BYTEA NOT NULL,
    metadata         BYTEA NOT NULL,
    CONSTRAINT uq_domain_events_sequence UNIQUE (aggregate_id, sequence_number),
    CONSTRAINT uq_domain_events_event_id UNIQUE (event_id)
)";

const CREATE_SNAPSHOTS_TABLE: &str = "CREATE TABLE IF NOT EXISTS snapshot_events (
    aggregate_type   TEXT NOT NULL,
    aggregate_id     TEXT NOT NULL,
    sequence_number  BIGINT NOT NULL,
    event_id         TEXT NOT NULL,
    event_timestamp  TIMESTAMPTZ NOT NULL,
    payload_type     TEXT NOT NULL,
    payload_revision TEXT,
    payload          BYTEA NOT NULL,
    metadata         BYTEA NOT NULL,
    PRIMARY KEY (aggregate_id, sequence_number)
)";

const INSERT_EVENT: &str = "INSERT INTO domain_events (
    aggregate_type, aggregate_id, sequence_number, event_id, event_timestamp,
    payload_type, payload_revision, payload, metadata
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

const INSERT_SNAPSHOT: &str = "INSERT INTO snapshot_events (
    aggregate_type, aggregate_id, sequence_number, event_id, event_timestamp,
    payload_type, payload_revision, payload, metadata
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

pub struct PostgresBackend {
    pool: PgPool,
    classifier: PostgresErrorClassifier,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            classifier: PostgresErrorClassifier,
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url)
            .await
            .context("failed to connect to postgres")?;
        Ok(Self::new(pool))
    }

    /// Create the event and snapshot tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_EVENTS_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_SNAPSHOTS_TABLE).execute(&self.pool).await?;
        tracing::info!("event store schema is in place");
        Ok(())
    }
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    record: &'q EventRecord,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&record.aggregate_type)
        .bind(&record.aggregate_id)
        .bind(record.sequence_number)
        .bind(&record.event_id)
        .bind(record.timestamp)
        .bind(&record.payload_type)
        .bind(&record.payload_revision)
        .bind(&record.payload)
        .bind(&record.metadata)
}

fn record_from_row(row: &PgRow) -> Result<EventRecord> {
    Ok(EventRecord {
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        sequence_number: row.try_get("sequence_number")?,
        event_id: row.try_get("event_id")?,
        timestamp: row.try_get::<DateTime<Utc>, _>("event_timestamp")?,
        payload_type: row.try_get("payload_type")?,
        payload_revision: row.try_get("payload_revision")?,
        payload: row.try_get("payload")?,
        metadata: row.try_get("metadata")?,
    })
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    async fn insert_events(&self, records: &[EventRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            bind_record(sqlx::query(INSERT_EVENT), record)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_aggregate_events(
        &self,
        aggregate_id: &str,
        from_sequence: i64,
        batch_size: usize,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            "SELECT aggregate_type, aggregate_id, sequence_number, event_id, event_timestamp,
                    payload_type, payload_revision, payload, metadata
             FROM domain_events
             WHERE aggregate_id = $1 AND sequence_number >= $2
             ORDER BY sequence_number ASC
             LIMIT $3",
        )
        .bind(aggregate_id)
        .bind(from_sequence)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn fetch_tracked_events(&self, floor: i64, batch_size: usize) -> Result<Vec<TrackedEventRecord>> {
        let rows = sqlx::query(
            "SELECT global_position, aggregate_type, aggregate_id, sequence_number, event_id,
                    event_timestamp, payload_type, payload_revision, payload, metadata
             FROM domain_events
             WHERE global_position > $1
             ORDER BY global_position ASC
             LIMIT $2",
        )
        .bind(floor)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TrackedEventRecord {
                    global_position: row.try_get("global_position")?,
                    record: record_from_row(row)?,
                })
            })
            .collect()
    }

    async fn insert_snapshot(&self, snapshot: &EventRecord) -> Result<()> {
        // Delete + insert in one transaction: a failed insert must roll the
        // delete back rather than leave the aggregate without any snapshot.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM snapshot_events WHERE aggregate_id = $1")
            .bind(&snapshot.aggregate_id)
            .execute(&mut *tx)
            .await?;
        bind_record(sqlx::query(INSERT_SNAPSHOT), snapshot)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_latest_snapshot(&self, aggregate_id: &str) -> Result<Option<EventRecord>> {
        let row = sqlx::query(
            "SELECT aggregate_type, aggregate_id, sequence_number, event_id, event_timestamp,
                    payload_type, payload_revision, payload, metadata
             FROM snapshot_events
             WHERE aggregate_id = $1
             ORDER BY sequence_number DESC
             LIMIT 1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn last_sequence_number(&self, aggregate_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(sequence_number) AS tail FROM domain_events WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<i64>, _>("tail")?)
    }

    async fn max_global_position(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(global_position), 0) AS head FROM domain_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("head")?)
    }

    fn classifier(&self) -> &dyn ErrorClassifier {
        &self.classifier
    }
}

// ============================================================================
// SQLSTATE Classification
// ============================================================================

/// SQLSTATE class 23505 is unique_violation; classes 08 (connection), 53
/// (insufficient resources) and 57 (operator intervention, includes shutdown
/// and query cancellation) are transient infrastructure failures.
fn kind_for_sqlstate(code: &str) -> ErrorKind {
    if code == "23505" {
        ErrorKind::ConcurrencyConflict
    } else if code.starts_with("08") || code.starts_with("53") || code.starts_with("57") {
        ErrorKind::StorageUnavailable
    } else {
        ErrorKind::Unknown
    }
}

pub struct PostgresErrorClassifier;

impl ErrorClassifier for PostgresErrorClassifier {
    fn classify(&self, raw: &anyhow::Error) -> ErrorKind {
        let Some(error) = raw.downcast_ref::<sqlx::Error>() else {
            return ErrorKind::Unknown;
        };
        match error {
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| kind_for_sqlstate(&code))
                .unwrap_or(ErrorKind::Unknown),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ErrorKind::StorageUnavailable
            }
            _ => ErrorKind::Unknown,
        }
    }
}

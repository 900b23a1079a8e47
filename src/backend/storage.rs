use anyhow::Result;
use async_trait::async_trait;

use crate::core::{EventRecord, TrackedEventRecord};
use crate::error::ErrorClassifier;

// ============================================================================
// Storage Backend Contract
// ============================================================================
//
// The narrow boundary between the ordering/gap/batching algorithm and a
// concrete store. Implementations must provide:
//
// 1. Transactional insert of event records with global-position assignment.
//    Positions come from the store's own atomic sequence, never from an
//    in-process counter, so assignment stays correct across processes.
// 2. Transactional delete+insert for snapshots (replace-set semantics).
// 3. Ordered range queries by sequence number and by global position.
// 4. A backend-specific error signal the conflict classifier can distinguish.
//
// Errors cross this boundary raw; the engine maps them through the backend's
// classifier. Implementations must not retry or reorder.
//
// ============================================================================

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist all records in one atomic unit, letting the store assign each
    /// a global position. Either every record becomes durable or none does.
    /// A uniqueness violation on (aggregate_id, sequence_number) must surface
    /// as an error the classifier resolves to a concurrency conflict.
    async fn insert_events(&self, records: &[EventRecord]) -> Result<()>;

    /// Up to `batch_size` events of one aggregate with sequence number
    /// `>= from_sequence`, ascending by sequence number.
    async fn fetch_aggregate_events(
        &self,
        aggregate_id: &str,
        from_sequence: i64,
        batch_size: usize,
    ) -> Result<Vec<EventRecord>>;

    /// Up to `batch_size` committed events with global position strictly
    /// greater than `floor`, ascending by global position. Uncommitted events
    /// must never appear (read-committed isolation or better).
    async fn fetch_tracked_events(&self, floor: i64, batch_size: usize) -> Result<Vec<TrackedEventRecord>>;

    /// Replace the aggregate's snapshot set with this snapshot: delete all
    /// prior snapshots for the aggregate and insert the new one in a single
    /// transaction. On failure no snapshot may be lost to a half-applied
    /// delete.
    async fn insert_snapshot(&self, snapshot: &EventRecord) -> Result<()>;

    /// The snapshot with the highest sequence number for the aggregate.
    async fn fetch_latest_snapshot(&self, aggregate_id: &str) -> Result<Option<EventRecord>>;

    /// Highest stored sequence number for the aggregate, `None` when the
    /// aggregate has no events.
    async fn last_sequence_number(&self, aggregate_id: &str) -> Result<Option<i64>>;

    /// Highest global position assigned to a committed event, `0` for an
    /// empty store.
    async fn max_global_position(&self) -> Result<i64>;

    /// The error-classification strategy for this backend family.
    fn classifier(&self) -> &dyn ErrorClassifier;
}

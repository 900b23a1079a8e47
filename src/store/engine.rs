use std::sync::Arc;

use crate::backend::StorageBackend;
use crate::config::EngineConfig;
use crate::core::{EventRecord, TrackingToken};
use crate::error::{classify_raw, EventStoreError};

// ============================================================================
// Event Storage Engine
// ============================================================================
//
// Backend-agnostic engine over the narrow StorageBackend contract.
//
// Responsibilities:
// 1. Append batches of events atomically (append-only, optimistic concurrency)
// 2. Store/prune/read snapshots
// 3. Expose the per-aggregate and global read paths (see reader.rs)
//
// The engine is stateless between calls: no internal cache, no lock, no
// cursor. Appends for the same aggregate must be serialized by the caller;
// losers of a same-sequence race observe ConcurrencyConflict, never a silent
// overwrite. Nothing here retries; retry policy belongs to the caller.
//
// ============================================================================

pub struct EventStorageEngine {
    backend: Arc<dyn StorageBackend>,
    config: EngineConfig,
}

impl EventStorageEngine {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: Arc<dyn StorageBackend>, config: EngineConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub(crate) fn classify(&self, raw: anyhow::Error) -> EventStoreError {
        classify_raw(self.backend.classifier(), raw)
    }

    /// Append a run of events for one aggregate in a single atomic unit.
    ///
    /// The batch must belong to a single aggregate and continue its sequence
    /// contiguously; the first sequence number must follow the aggregate's
    /// current tail (or be 0 for a new aggregate). Empty input is a no-op.
    /// Global positions are assigned by the store and not surfaced here; the
    /// global stream makes them visible on the read side.
    pub async fn append_events(&self, events: Vec<EventRecord>) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }
        validate_batch(&events)?;

        let aggregate_id = events[0].aggregate_id.clone();
        let first_sequence = events[0].sequence_number;
        let count = events.len();

        self.backend
            .insert_events(&events)
            .await
            .map_err(|raw| self.classify(raw))?;

        tracing::info!(
            aggregate_id = %aggregate_id,
            first_sequence = first_sequence,
            event_count = count,
            "✅ Appended events to event store"
        );
        Ok(())
    }

    /// Store a snapshot, replacing every older snapshot of the aggregate.
    /// Delete and insert happen in one transaction: either the new snapshot
    /// is in place afterwards or the old ones are still there.
    pub async fn store_snapshot(&self, snapshot: EventRecord) -> Result<(), EventStoreError> {
        let aggregate_id = snapshot.aggregate_id.clone();
        let sequence = snapshot.sequence_number;

        self.backend
            .insert_snapshot(&snapshot)
            .await
            .map_err(|raw| self.classify(raw))?;

        tracing::info!(
            aggregate_id = %aggregate_id,
            sequence_number = sequence,
            "stored snapshot, pruned older ones"
        );
        Ok(())
    }

    /// The most recent snapshot for the aggregate, if any. Read without
    /// locking: a stale snapshot is fine, the caller replays the tail of the
    /// event stream on top of it.
    pub async fn read_latest_snapshot(&self, aggregate_id: &str) -> Result<Option<EventRecord>, EventStoreError> {
        self.backend
            .fetch_latest_snapshot(aggregate_id)
            .await
            .map_err(|raw| self.classify(raw))
    }

    /// The aggregate's current tail sequence number, `None` for an unknown
    /// aggregate. Callers use this to compute the next expected run.
    pub async fn last_sequence_number(&self, aggregate_id: &str) -> Result<Option<i64>, EventStoreError> {
        self.backend
            .last_sequence_number(aggregate_id)
            .await
            .map_err(|raw| self.classify(raw))
    }

    /// Token positioned before the first event of the global stream.
    pub fn tail_token() -> TrackingToken {
        TrackingToken::new()
    }

    /// Token positioned at the current end of the global stream: a consumer
    /// starting here sees only events committed after this call.
    pub async fn head_token(&self) -> Result<TrackingToken, EventStoreError> {
        let head = self
            .backend
            .max_global_position()
            .await
            .map_err(|raw| self.classify(raw))?;
        Ok(TrackingToken::from_parts(head, []))
    }
}

/// Batch preconditions: one aggregate, contiguous ascending sequence run.
fn validate_batch(events: &[EventRecord]) -> Result<(), EventStoreError> {
    let first = &events[0];
    for (offset, event) in events.iter().enumerate() {
        if event.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidRecord(format!(
                "append batch mixes aggregates {} and {}",
                first.aggregate_id, event.aggregate_id
            )));
        }
        let expected = first.sequence_number + offset as i64;
        if event.sequence_number != expected {
            return Err(EventStoreError::InvalidRecord(format!(
                "append batch for {} is not contiguous: expected sequence {}, got {}",
                first.aggregate_id, expected, event.sequence_number
            )));
        }
    }
    Ok(())
}

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::backend::StorageBackend;
use crate::core::{EventRecord, TrackedEventRecord};
use crate::error::{ErrorClassifier, ErrorKind};

// ============================================================================
// In-Memory Storage Backend
// ============================================================================
//
// Supports the test suite and local development without a database.
//
// Responsibilities:
// - Assign global positions from a store-side counter, visible at commit.
// - Enforce optimistic concurrency on (aggregate_id, sequence_number).
// - Model reserve-then-commit so tests can open real gaps: positions are
//   claimed when a write begins, and an aborted write leaves its positions
//   permanently empty, exactly like a rolled-back transaction over an
//   auto-increment sequence.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MemoryBackendError {
    #[error("sequence number {sequence} for aggregate {aggregate_id} conflicts with expected {expected}")]
    SequenceConflict {
        aggregate_id: String,
        sequence: i64,
        expected: i64,
    },

    #[error("storage offline (injected fault)")]
    Offline,
}

#[derive(Default)]
struct MemoryState {
    /// Last reserved global position. Positions start at 1.
    last_position: i64,
    /// Committed events by global position.
    events: BTreeMap<i64, EventRecord>,
    /// Per aggregate: sequence number -> global position.
    streams: HashMap<String, BTreeMap<i64, i64>>,
    /// Per aggregate: sequence number -> snapshot record.
    snapshots: HashMap<String, BTreeMap<i64, EventRecord>>,
    fail_next: bool,
}

impl MemoryState {
    fn check_fault(&mut self) -> Result<(), MemoryBackendError> {
        if self.fail_next {
            self.fail_next = false;
            return Err(MemoryBackendError::Offline);
        }
        Ok(())
    }

    fn next_expected_sequence(&self, aggregate_id: &str) -> i64 {
        self.streams
            .get(aggregate_id)
            .and_then(|stream| stream.last_key_value())
            .map(|(sequence, _)| sequence + 1)
            .unwrap_or(0)
    }

    fn commit(&mut self, positions: &[i64], records: &[EventRecord]) {
        for (position, record) in positions.iter().zip(records) {
            self.streams
                .entry(record.aggregate_id.clone())
                .or_default()
                .insert(record.sequence_number, *position);
            self.events.insert(*position, record.clone());
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
    classifier: MemoryErrorClassifier,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next backend operation fail as if the store were unreachable.
    pub async fn fail_next_operation(&self) {
        self.state.write().await.fail_next = true;
    }

    /// Reserve `count` global positions without committing anything, the way
    /// an in-flight transaction does. Dropping the reservation (never calling
    /// [`MemoryBackend::commit_reserved`]) leaves the positions permanently
    /// empty: a gap.
    pub async fn reserve_positions(&self, count: usize) -> Vec<i64> {
        let mut state = self.state.write().await;
        let first = state.last_position + 1;
        state.last_position += count as i64;
        (first..=state.last_position).collect()
    }

    /// Commit records into previously reserved positions: the late-arriving
    /// transaction that fills a gap other consumers have already passed.
    pub async fn commit_reserved(&self, positions: &[i64], records: &[EventRecord]) -> Result<()> {
        if positions.len() != records.len() {
            bail!(
                "reserved {} positions but got {} records",
                positions.len(),
                records.len()
            );
        }
        let mut state = self.state.write().await;
        state.commit(positions, records);
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn insert_events(&self, records: &[EventRecord]) -> Result<()> {
        let mut state = self.state.write().await;
        state.check_fault()?;

        // All checks before any mutation: the batch is all-or-nothing.
        if let Some(first) = records.first() {
            let expected = state.next_expected_sequence(&first.aggregate_id);
            if first.sequence_number != expected {
                return Err(MemoryBackendError::SequenceConflict {
                    aggregate_id: first.aggregate_id.clone(),
                    sequence: first.sequence_number,
                    expected,
                }
                .into());
            }
        }

        let first = state.last_position + 1;
        state.last_position += records.len() as i64;
        let positions: Vec<i64> = (first..=state.last_position).collect();
        state.commit(&positions, records);
        Ok(())
    }

    async fn fetch_aggregate_events(
        &self,
        aggregate_id: &str,
        from_sequence: i64,
        batch_size: usize,
    ) -> Result<Vec<EventRecord>> {
        let mut state = self.state.write().await;
        state.check_fault()?;
        let Some(stream) = state.streams.get(aggregate_id) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .range(from_sequence..)
            .take(batch_size)
            .filter_map(|(_, position)| state.events.get(position).cloned())
            .collect())
    }

    async fn fetch_tracked_events(&self, floor: i64, batch_size: usize) -> Result<Vec<TrackedEventRecord>> {
        let mut state = self.state.write().await;
        state.check_fault()?;
        Ok(state
            .events
            .range(floor + 1..)
            .take(batch_size)
            .map(|(position, record)| TrackedEventRecord {
                global_position: *position,
                record: record.clone(),
            })
            .collect())
    }

    async fn insert_snapshot(&self, snapshot: &EventRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state.check_fault()?;
        let snapshots = state.snapshots.entry(snapshot.aggregate_id.clone()).or_default();
        snapshots.clear();
        snapshots.insert(snapshot.sequence_number, snapshot.clone());
        Ok(())
    }

    async fn fetch_latest_snapshot(&self, aggregate_id: &str) -> Result<Option<EventRecord>> {
        let mut state = self.state.write().await;
        state.check_fault()?;
        Ok(state
            .snapshots
            .get(aggregate_id)
            .and_then(|snapshots| snapshots.last_key_value())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn last_sequence_number(&self, aggregate_id: &str) -> Result<Option<i64>> {
        let mut state = self.state.write().await;
        state.check_fault()?;
        Ok(state
            .streams
            .get(aggregate_id)
            .and_then(|stream| stream.last_key_value())
            .map(|(sequence, _)| *sequence))
    }

    async fn max_global_position(&self) -> Result<i64> {
        let mut state = self.state.write().await;
        state.check_fault()?;
        Ok(state
            .events
            .last_key_value()
            .map(|(position, _)| *position)
            .unwrap_or(0))
    }

    fn classifier(&self) -> &dyn ErrorClassifier {
        &self.classifier
    }
}

#[derive(Default)]
pub struct MemoryErrorClassifier;

impl ErrorClassifier for MemoryErrorClassifier {
    fn classify(&self, raw: &anyhow::Error) -> ErrorKind {
        match raw.downcast_ref::<MemoryBackendError>() {
            Some(MemoryBackendError::SequenceConflict { .. }) => ErrorKind::ConcurrencyConflict,
            Some(MemoryBackendError::Offline) => ErrorKind::StorageUnavailable,
            None => ErrorKind::Unknown,
        }
    }
}

use chrono::Utc;
use futures_util::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::StorageBackend;
use crate::core::{EventRecord, TrackedEventRecord, TrackingToken};
use crate::error::{classify_raw, EventStoreError};
use crate::store::engine::EventStorageEngine;

// ============================================================================
// Stream Reader - Per-Aggregate Replay & Global Catch-Up
// ============================================================================
//
// Two read paths over the same store:
//
// (a) Per-aggregate replay: a lazy, finite stream of one aggregate's events
//     in sequence order, fetched in batches. Rehydration logic consults the
//     snapshot store first and starts from snapshot.sequence_number + 1.
//
// (b) Global catch-up: one bounded fetch per call, returning newer events
//     plus the advanced tracking token. Gap handling is the subtle part,
//     see the token module. Each call is a single round trip and never
//     blocks waiting for new events; polling cadence belongs to the caller.
//
// ============================================================================

/// One batch from the global stream: the events plus the token to resume from.
#[derive(Clone, Debug)]
pub struct GlobalBatch {
    pub events: Vec<TrackedEventRecord>,
    pub token: TrackingToken,
}

struct AggregateReadState {
    backend: Arc<dyn StorageBackend>,
    aggregate_id: String,
    next_sequence: i64,
    batch_size: usize,
    buffer: VecDeque<EventRecord>,
    exhausted: bool,
}

impl EventStorageEngine {
    /// Lazily stream one aggregate's events with sequence number
    /// `>= from_sequence`, ascending, fetching up to `batch_size` records per
    /// round trip. A batch shorter than `batch_size` ends the stream. An
    /// empty range yields an empty stream, not an error.
    pub fn read_aggregate_stream(
        &self,
        aggregate_id: &str,
        from_sequence: i64,
        batch_size: usize,
    ) -> impl Stream<Item = Result<EventRecord, EventStoreError>> + Send + 'static {
        let state = AggregateReadState {
            backend: Arc::clone(self.backend()),
            aggregate_id: aggregate_id.to_string(),
            next_sequence: from_sequence,
            batch_size,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.buffer.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.exhausted {
                    return Ok(None);
                }

                let batch = state
                    .backend
                    .fetch_aggregate_events(&state.aggregate_id, state.next_sequence, state.batch_size)
                    .await
                    .map_err(|raw| classify_raw(state.backend.classifier(), raw))?;

                tracing::debug!(
                    aggregate_id = %state.aggregate_id,
                    from_sequence = state.next_sequence,
                    fetched = batch.len(),
                    "fetched aggregate batch"
                );

                if batch.len() < state.batch_size {
                    state.exhausted = true;
                }
                if let Some(last) = batch.last() {
                    state.next_sequence = last.sequence_number + 1;
                }
                if batch.is_empty() {
                    return Ok(None);
                }
                state.buffer = batch.into();
            }
        })
    }

    /// Fetch the next batch of the global stream after `token`, returning the
    /// events plus the token to resume from.
    ///
    /// The fetch floor is lowered below the oldest open gap so that a late
    /// commit landing in a gap is still observed. Re-fetched events the
    /// consumer already saw are skipped; unseen positions the batch jumps
    /// over are recorded as new gaps. Gaps expire by position distance
    /// (`max_gap_offset`) and by age: once a committed event older than
    /// `gap_timeout` is seen above a gap, the reservation holding that gap
    /// can no longer be in flight and the gap is dropped.
    ///
    /// When the store has nothing beyond the floor the token comes back
    /// unchanged, no false advancement.
    pub async fn read_global_stream(
        &self,
        token: &TrackingToken,
        batch_size: usize,
    ) -> Result<GlobalBatch, EventStoreError> {
        let floor = token.query_floor();
        let fetched = self
            .backend()
            .fetch_tracked_events(floor, batch_size)
            .await
            .map_err(|raw| self.classify(raw))?;

        if fetched.is_empty() {
            return Ok(GlobalBatch {
                events: Vec::new(),
                token: token.clone(),
            });
        }

        let stale_cutoff = Utc::now() - self.config().gap_timeout;
        let mut next = token.clone();
        let mut events = Vec::with_capacity(fetched.len());

        for tracked in fetched {
            if tracked.record.timestamp < stale_cutoff {
                next.prune_gaps_below(tracked.global_position);
            }
            if next.covers(tracked.global_position) {
                continue;
            }
            next = next.advance_to(tracked.global_position, self.config().max_gap_offset);
            events.push(tracked);
        }

        tracing::debug!(
            floor,
            returned = events.len(),
            high_water_mark = next.index,
            open_gaps = next.gaps.len(),
            "read global batch"
        );

        Ok(GlobalBatch { events, token: next })
    }
}

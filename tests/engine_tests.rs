// Integration tests for the storage engine against the in-memory backend:
// append/replay contracts, optimistic concurrency, snapshot pruning, and the
// gap-aware global catch-up stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::TryStreamExt;

use event_ledger::{
    EngineConfig, EventRecord, EventStorageEngine, EventStoreError, MemoryBackend, TrackingToken,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn record(aggregate_id: &str, sequence: i64) -> EventRecord {
    EventRecord::new("Order", aggregate_id, sequence, "TestEvent", b"{}".to_vec()).unwrap()
}

fn setup() -> (Arc<MemoryBackend>, EventStorageEngine) {
    setup_with(EngineConfig::default())
}

fn setup_with(config: EngineConfig) -> (Arc<MemoryBackend>, EventStorageEngine) {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let engine = EventStorageEngine::with_config(backend.clone(), config);
    (backend, engine)
}

async fn replay_sequences(engine: &EventStorageEngine, aggregate_id: &str) -> Vec<i64> {
    engine
        .read_aggregate_stream(aggregate_id, 0, 10)
        .try_collect::<Vec<_>>()
        .await
        .unwrap()
        .iter()
        .map(|event| event.sequence_number)
        .collect()
}

// ----------------------------------------------------------------------------
// Append + per-aggregate replay
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_full_replay_is_contiguous_from_zero() {
    let (_, engine) = setup();
    engine
        .append_events((0..4).map(|seq| record("order-1", seq)).collect())
        .await
        .unwrap();
    engine
        .append_events((4..6).map(|seq| record("order-1", seq)).collect())
        .await
        .unwrap();

    // Batch size smaller than the stream forces multiple round trips.
    let events: Vec<EventRecord> = engine
        .read_aggregate_stream("order-1", 0, 4)
        .try_collect()
        .await
        .unwrap();
    let sequences: Vec<i64> = events.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequences, (0..6).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_replay_example_order_1() {
    let (_, engine) = setup();
    engine
        .append_events((0..3).map(|seq| record("order-1", seq)).collect())
        .await
        .unwrap();

    let events: Vec<EventRecord> = engine
        .read_aggregate_stream("order-1", 0, 10)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));

    let beyond: Vec<EventRecord> = engine
        .read_aggregate_stream("order-1", 3, 10)
        .try_collect()
        .await
        .unwrap();
    assert!(beyond.is_empty());
}

#[tokio::test]
async fn test_empty_append_is_a_no_op() {
    let (_, engine) = setup();
    engine.append_events(Vec::new()).await.unwrap();
    assert!(replay_sequences(&engine, "order-1").await.is_empty());
}

#[tokio::test]
async fn test_append_not_continuing_tail_fails() {
    let (_, engine) = setup();
    engine
        .append_events(vec![record("order-1", 0), record("order-1", 1)])
        .await
        .unwrap();

    // Overlapping an existing sequence number loses the optimistic race.
    let overlap = engine.append_events(vec![record("order-1", 1)]).await;
    assert!(matches!(overlap, Err(EventStoreError::ConcurrencyConflict(_))));

    // A batch that is not internally contiguous is a caller bug.
    let ragged = engine
        .append_events(vec![record("order-1", 2), record("order-1", 4)])
        .await;
    assert!(matches!(ragged, Err(EventStoreError::InvalidRecord(_))));

    assert_eq!(replay_sequences(&engine, "order-1").await, vec![0, 1]);
}

#[tokio::test]
async fn test_concurrent_appends_have_exactly_one_winner() {
    let (_, engine) = setup();
    let engine = Arc::new(engine);

    let first = {
        let engine = engine.clone();
        let batch = vec![record("order-race", 0)];
        tokio::spawn(async move { engine.append_events(batch).await })
    };
    let second = {
        let engine = engine.clone();
        let batch = vec![record("order-race", 0)];
        tokio::spawn(async move { engine.append_events(batch).await })
    };

    let results = vec![first.await.unwrap(), second.await.unwrap()];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = results.into_iter().find(|r| r.is_err()).unwrap();
    assert!(matches!(loser, Err(EventStoreError::ConcurrencyConflict(_))));

    assert_eq!(replay_sequences(&engine, "order-race").await, vec![0]);
}

#[tokio::test]
async fn test_storage_fault_fails_whole_batch() {
    let (backend, engine) = setup();
    backend.fail_next_operation().await;

    let result = engine
        .append_events(vec![record("order-1", 0), record("order-1", 1)])
        .await;
    assert!(matches!(result, Err(EventStoreError::StorageUnavailable(_))));
    assert!(result.unwrap_err().is_retryable());

    // Nothing from the failed batch is observable; the retry succeeds.
    assert!(replay_sequences(&engine, "order-1").await.is_empty());
    engine
        .append_events(vec![record("order-1", 0), record("order-1", 1)])
        .await
        .unwrap();
    assert_eq!(replay_sequences(&engine, "order-1").await, vec![0, 1]);
}

#[tokio::test]
async fn test_last_sequence_number() {
    let (_, engine) = setup();
    assert_eq!(engine.last_sequence_number("order-1").await.unwrap(), None);

    engine
        .append_events((0..3).map(|seq| record("order-1", seq)).collect())
        .await
        .unwrap();
    assert_eq!(engine.last_sequence_number("order-1").await.unwrap(), Some(2));
}

// ----------------------------------------------------------------------------
// Global catch-up
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_global_stream_example_three_aggregates() {
    let (_, engine) = setup();
    for aggregate in ["a", "b", "c"] {
        engine.append_events(vec![record(aggregate, 0)]).await.unwrap();
    }

    let batch = engine
        .read_global_stream(&TrackingToken::new(), 10)
        .await
        .unwrap();
    let positions: Vec<i64> = batch.events.iter().map(|e| e.global_position).collect();
    assert_eq!(positions, vec![1, 2, 3]);
    assert_eq!(batch.token.index, 3);
    assert!(batch.token.gaps.is_empty());
}

#[tokio::test]
async fn test_global_resumption_is_idempotent() {
    let (_, engine) = setup();
    for (aggregate, sequence) in [("a", 0), ("b", 0), ("a", 1), ("c", 0), ("b", 1), ("a", 2)] {
        engine.append_events(vec![record(aggregate, sequence)]).await.unwrap();
    }

    // One pass with a large batch.
    let single = engine
        .read_global_stream(&TrackingToken::new(), 100)
        .await
        .unwrap();
    let expected: Vec<(i64, String)> = single
        .events
        .iter()
        .map(|e| (e.global_position, e.record.event_id.clone()))
        .collect();
    assert_eq!(expected.len(), 6);

    // Many passes with batch size 1, persisting and reloading the token as an
    // opaque checkpoint between every call.
    let mut seen = Vec::new();
    let mut token = TrackingToken::new();
    loop {
        let checkpoint = serde_json::to_string(&token).unwrap();
        token = serde_json::from_str(&checkpoint).unwrap();

        let batch = engine.read_global_stream(&token, 1).await.unwrap();
        if batch.events.is_empty() {
            break;
        }
        seen.extend(
            batch
                .events
                .iter()
                .map(|e| (e.global_position, e.record.event_id.clone())),
        );
        token = batch.token;
    }
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_gap_is_rechecked_and_filled_by_late_commit() {
    let (backend, engine) = setup();
    engine.append_events(vec![record("a", 0)]).await.unwrap();
    let reserved = backend.reserve_positions(1).await;
    engine.append_events(vec![record("b", 0)]).await.unwrap();

    // First pass jumps the uncommitted position and records it as a gap.
    let first = engine.read_global_stream(&TrackingToken::new(), 10).await.unwrap();
    let positions: Vec<i64> = first.events.iter().map(|e| e.global_position).collect();
    assert_eq!(positions, vec![1, 3]);
    assert_eq!(first.token.index, 3);
    assert!(first.token.gaps.contains(&2));

    // While the gap stays open and young, re-reads return nothing new and do
    // not advance the token.
    let quiet = engine.read_global_stream(&first.token, 10).await.unwrap();
    assert!(quiet.events.is_empty());
    assert_eq!(quiet.token, first.token);

    // The reserving writer finally commits: the event surfaces out of global
    // order and the gap closes, without moving the high-water mark.
    backend.commit_reserved(&reserved, &[record("c", 0)]).await.unwrap();
    let filled = engine.read_global_stream(&first.token, 10).await.unwrap();
    let positions: Vec<i64> = filled.events.iter().map(|e| e.global_position).collect();
    assert_eq!(positions, vec![2]);
    assert_eq!(filled.token.index, 3);
    assert!(filled.token.gaps.is_empty());
}

#[tokio::test]
async fn test_gap_from_aborted_writer_expires_by_age() {
    let (backend, engine) = setup_with(EngineConfig::default().with_gap_timeout(Duration::ZERO));
    engine.append_events(vec![record("a", 0)]).await.unwrap();
    let _abandoned = backend.reserve_positions(1).await;
    engine.append_events(vec![record("b", 0)]).await.unwrap();

    let first = engine.read_global_stream(&TrackingToken::new(), 10).await.unwrap();
    assert!(first.token.gaps.contains(&2));

    // The re-read sees a committed event above the gap that is already older
    // than the (zero) timeout, so the gap is presumed permanently absent.
    let second = engine.read_global_stream(&first.token, 10).await.unwrap();
    assert!(second.events.is_empty());
    assert!(second.token.gaps.is_empty());

    // With the gap gone the floor moves up and re-reads go quiet.
    let third = engine.read_global_stream(&second.token, 10).await.unwrap();
    assert!(third.events.is_empty());
    assert_eq!(third.token, second.token);
}

#[tokio::test]
async fn test_gap_expires_by_position_distance() {
    let (backend, engine) = setup_with(EngineConfig::default().with_max_gap_offset(2));
    engine.append_events(vec![record("a", 0)]).await.unwrap();
    let _abandoned = backend.reserve_positions(1).await;
    engine
        .append_events((0..4).map(|seq| record("b", seq)).collect())
        .await
        .unwrap();

    // Positions run 1, <hole at 2>, 3..6; the gap trails more than
    // max_gap_offset behind the high-water mark and is dropped.
    let batch = engine.read_global_stream(&TrackingToken::new(), 10).await.unwrap();
    assert_eq!(batch.token.index, 6);
    assert!(batch.token.gaps.is_empty());
}

#[tokio::test]
async fn test_head_token_sees_only_new_events() {
    let (_, engine) = setup();
    engine
        .append_events((0..3).map(|seq| record("a", seq)).collect())
        .await
        .unwrap();

    let head = engine.head_token().await.unwrap();
    let quiet = engine.read_global_stream(&head, 10).await.unwrap();
    assert!(quiet.events.is_empty());

    engine.append_events(vec![record("b", 0)]).await.unwrap();
    let batch = engine.read_global_stream(&head, 10).await.unwrap();
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.events[0].record.aggregate_id, "b");
}

// ----------------------------------------------------------------------------
// Snapshots
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_new_snapshot_replaces_prior_ones() {
    let (_, engine) = setup();
    engine
        .store_snapshot(record("order-a", 5).with_revision("1"))
        .await
        .unwrap();
    engine
        .store_snapshot(record("order-b", 7).with_revision("1"))
        .await
        .unwrap();
    engine
        .store_snapshot(record("order-a", 10).with_revision("1"))
        .await
        .unwrap();

    let latest = engine.read_latest_snapshot("order-a").await.unwrap().unwrap();
    assert_eq!(latest.sequence_number, 10);

    // Other aggregates keep their snapshots.
    let other = engine.read_latest_snapshot("order-b").await.unwrap().unwrap();
    assert_eq!(other.sequence_number, 7);

    assert!(engine.read_latest_snapshot("order-c").await.unwrap().is_none());
}

#[tokio::test]
async fn test_snapshot_shortens_replay() {
    let (_, engine) = setup();
    engine
        .append_events((0..8).map(|seq| record("order-1", seq)).collect())
        .await
        .unwrap();
    engine.store_snapshot(record("order-1", 5)).await.unwrap();

    // Rehydration: consult the snapshot, then replay only the tail.
    let snapshot = engine.read_latest_snapshot("order-1").await.unwrap().unwrap();
    let tail: Vec<EventRecord> = engine
        .read_aggregate_stream("order-1", snapshot.sequence_number + 1, 10)
        .try_collect()
        .await
        .unwrap();
    let sequences: Vec<i64> = tail.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequences, vec![6, 7]);
}

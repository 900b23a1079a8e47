use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EventStoreError;

// ============================================================================
// Event Record Model - Canonical Stored Event Shape
// ============================================================================
//
// The record is a pure data contract. Payload and metadata are opaque bytes:
// the engine never inspects them, it only carries the payload type + revision
// strings through unchanged so a serializer on the consuming side can decode.
//
// Invariants:
// - sequence_number is non-negative and, per aggregate, contiguous from 0
// - aggregate_id and event_id are non-empty
//
// ============================================================================

/// An immutable domain event as persisted in the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Zero-based position of the event within its aggregate.
    pub sequence_number: i64,
    /// Globally unique event identifier.
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// Identifies the schema of the serialized payload.
    pub payload_type: String,
    pub payload_revision: Option<String>,
    /// Opaque serialized payload.
    pub payload: Vec<u8>,
    /// Opaque serialized metadata.
    pub metadata: Vec<u8>,
}

impl EventRecord {
    /// Create a record for a freshly produced event, assigning a new event
    /// identifier and the current timestamp.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        sequence_number: i64,
        payload_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Self, EventStoreError> {
        Self::from_parts(
            aggregate_type.into(),
            aggregate_id.into(),
            sequence_number,
            Uuid::new_v4().to_string(),
            Utc::now(),
            payload_type.into(),
            None,
            payload,
            Vec::new(),
        )
    }

    /// Reconstruct a record from stored parts, re-checking the invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        aggregate_type: String,
        aggregate_id: String,
        sequence_number: i64,
        event_id: String,
        timestamp: DateTime<Utc>,
        payload_type: String,
        payload_revision: Option<String>,
        payload: Vec<u8>,
        metadata: Vec<u8>,
    ) -> Result<Self, EventStoreError> {
        if sequence_number < 0 {
            return Err(EventStoreError::InvalidRecord(format!(
                "sequence number must be non-negative, got {}",
                sequence_number
            )));
        }
        if aggregate_id.is_empty() {
            return Err(EventStoreError::InvalidRecord(
                "aggregate identifier must not be empty".to_string(),
            ));
        }
        if event_id.is_empty() {
            return Err(EventStoreError::InvalidRecord(
                "event identifier must not be empty".to_string(),
            ));
        }
        Ok(Self {
            aggregate_type,
            aggregate_id,
            sequence_number,
            event_id,
            timestamp,
            payload_type,
            payload_revision,
            payload,
            metadata,
        })
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.payload_revision = Some(revision.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An [`EventRecord`] as seen by the global stream: the record plus the
/// store-assigned global position. Positions are monotonically increasing and
/// unique across the store, but not necessarily contiguous: a rolled-back
/// transaction leaves its reserved positions permanently empty.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrackedEventRecord {
    pub global_position: i64,
    pub record: EventRecord,
}

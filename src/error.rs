// ============================================================================
// Error Taxonomy & Conflict Classification
// ============================================================================
//
// Four failure kinds cross the public API:
// - InvalidRecord:       malformed input, caller bug, not retryable
// - ConcurrencyConflict: expected under contention, caller may re-read + retry
// - StorageUnavailable:  transient infrastructure failure, retry with backoff
// - Unknown:             unclassified backend error, fatal for this attempt
//
// The engine never retries internally. Backends return raw errors; the engine
// maps them through the backend's classifier strategy.
//
// ============================================================================

/// Errors surfaced by the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("invalid event record: {0}")]
    InvalidRecord(String),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] anyhow::Error),

    #[error("unclassified storage failure: {0}")]
    Unknown(#[source] anyhow::Error),
}

impl EventStoreError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EventStoreError::ConcurrencyConflict(_) | EventStoreError::StorageUnavailable(_)
        )
    }
}

/// Classification outcome for a raw backend error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConcurrencyConflict,
    StorageUnavailable,
    Unknown,
}

/// Strategy that maps a backend-specific error signal onto an [`ErrorKind`].
///
/// One implementation exists per backend family. Implementations must be
/// conservative: when the error cannot be identified, return
/// [`ErrorKind::Unknown`] rather than guessing at a concurrency conflict,
/// which could mask a real data-loss condition.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, raw: &anyhow::Error) -> ErrorKind;
}

/// Map a raw backend error to the public taxonomy via the given classifier.
pub(crate) fn classify_raw(classifier: &dyn ErrorClassifier, raw: anyhow::Error) -> EventStoreError {
    match classifier.classify(&raw) {
        ErrorKind::ConcurrencyConflict => {
            tracing::debug!(error = %raw, "storage error classified as concurrency conflict");
            EventStoreError::ConcurrencyConflict(raw.to_string())
        }
        ErrorKind::StorageUnavailable => {
            tracing::warn!(error = %raw, "storage error classified as transient unavailability");
            EventStoreError::StorageUnavailable(raw)
        }
        ErrorKind::Unknown => {
            tracing::warn!(error = %raw, "storage error could not be classified");
            EventStoreError::Unknown(raw)
        }
    }
}

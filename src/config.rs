use std::time::Duration;

// ============================================================================
// Engine Configuration
// ============================================================================
//
// Tunables for gap handling on the global stream. Gap expiry is deliberately
// configurable rather than fixed: the right thresholds depend on the expected
// transaction-abort latency of the deployment.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum distance (in global positions) a gap may trail behind the
    /// high-water mark before it is presumed permanently absent and dropped
    /// from the tracking token. Bounds token size under sustained throughput.
    pub max_gap_offset: i64,
    /// Maximum age of a gap before it is presumed permanently absent. A gap is
    /// considered this old once a committed event *above* it carries a
    /// timestamp older than `now - gap_timeout`: positions are reserved in
    /// order, so the transaction holding the gap started even earlier and can
    /// no longer be in flight.
    pub gap_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_gap_offset: 10_000,
            gap_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn with_max_gap_offset(mut self, max_gap_offset: i64) -> Self {
        self.max_gap_offset = max_gap_offset;
        self
    }

    pub fn with_gap_timeout(mut self, gap_timeout: Duration) -> Self {
        self.gap_timeout = gap_timeout;
        self
    }
}

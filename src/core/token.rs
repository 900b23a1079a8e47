use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// Tracking Token - Resumable Cursor over the Global Stream
// ============================================================================
//
// Global positions are reserved when a transaction starts writing but become
// visible only at commit. A consumer that advances past a reserved-but-not-
// committed position must remember it as a gap and keep re-checking it, since
// the missing event may still appear there (or never, if the transaction
// aborted). The token therefore carries:
//
// - index: the high-water mark, the highest global position observed so far
// - gaps:  positions strictly below the index that have not been observed
//
// The token is a plain serializable value. The engine holds no cursor state of
// its own; consumers persist the token as their checkpoint and hand it back on
// the next call. It advances monotonically and is never rewound except by the
// consumer explicitly starting over from an older checkpoint.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackingToken {
    /// Highest global position observed by the consumer.
    pub index: i64,
    /// Open gaps: positions below `index` not yet observed.
    pub gaps: BTreeSet<i64>,
}

impl TrackingToken {
    /// Token positioned before the first event of the stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a token from checkpoint parts. Gap positions at or above the
    /// high-water mark are meaningless and silently discarded.
    pub fn from_parts(index: i64, gaps: impl IntoIterator<Item = i64>) -> Self {
        let gaps = gaps.into_iter().filter(|gap| *gap < index).collect();
        Self { index, gaps }
    }

    /// The exclusive lower bound for the next fetch. When gaps are open the
    /// floor drops below the oldest gap so a late-committing event at that
    /// position is still picked up.
    pub fn query_floor(&self) -> i64 {
        match self.gaps.first() {
            Some(oldest_gap) => oldest_gap - 1,
            None => self.index,
        }
    }

    /// Whether the consumer has already observed the event at `position`.
    /// Positions at or below the index are covered unless they are open gaps.
    pub fn covers(&self, position: i64) -> bool {
        position <= self.index && !self.gaps.contains(&position)
    }

    /// Advance the token over an observed event at `position`.
    ///
    /// Filling an open gap removes it without moving the index. Moving past
    /// the index records every skipped position in between as a new gap.
    /// Gaps trailing more than `max_gap_offset` behind the new index are
    /// presumed permanently absent and dropped. Positions already covered
    /// leave the token unchanged.
    pub fn advance_to(&self, position: i64, max_gap_offset: i64) -> Self {
        let mut gaps = self.gaps.clone();
        let index = if gaps.remove(&position) {
            self.index
        } else if position > self.index {
            gaps.extend(self.index + 1..position);
            position
        } else {
            return self.clone();
        };
        let horizon = index.saturating_sub(max_gap_offset);
        gaps.retain(|gap| *gap >= horizon);
        Self { index, gaps }
    }

    /// Drop open gaps strictly below `position`. Used when a committed event
    /// at `position` is old enough to prove that the transactions holding
    /// those earlier reservations can no longer be in flight.
    pub(crate) fn prune_gaps_below(&mut self, position: i64) {
        self.gaps.retain(|gap| *gap >= position);
    }
}

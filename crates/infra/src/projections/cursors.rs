use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use stocktake_core::{AggregateId, BranchId};

/// Branch+aggregate cursor key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    branch_id: BranchId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },

    #[error("cursor lock poisoned")]
    Poisoned,
}

/// Decision for an incoming envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CursorCheck {
    /// New position; apply the event, then `advance`.
    Apply,
    /// Replay at or below the cursor; safe to ignore.
    Duplicate,
}

/// Per-stream cursors supporting at-least-once delivery.
///
/// Every projection keeps one of these and consults it before applying an
/// envelope: replays at or below the cursor are ignored (idempotency), gaps
/// are rejected (ordering). The first event of a stream may arrive at any
/// positive sequence; after that strict `+1` increments are enforced.
///
/// Designed for single-threaded consumption per projection, matching the
/// one-subscriber-thread-per-projection wiring.
#[derive(Debug, Default)]
pub struct StreamCursors {
    inner: RwLock<HashMap<CursorKey, u64>>,
}

impl StreamCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(
        &self,
        branch_id: BranchId,
        aggregate_id: AggregateId,
        sequence_number: u64,
    ) -> Result<CursorCheck, CursorError> {
        let cursors = self.inner.read().map_err(|_| CursorError::Poisoned)?;
        let key = CursorKey {
            branch_id,
            aggregate_id,
        };
        let last = *cursors.get(&key).unwrap_or(&0);

        if sequence_number == 0 {
            return Err(CursorError::NonMonotonicSequence {
                last,
                found: sequence_number,
            });
        }
        if sequence_number <= last {
            return Ok(CursorCheck::Duplicate);
        }
        if last != 0 && sequence_number != last + 1 {
            return Err(CursorError::NonMonotonicSequence {
                last,
                found: sequence_number,
            });
        }

        Ok(CursorCheck::Apply)
    }

    /// Advance the cursor after a successful apply.
    pub fn advance(&self, branch_id: BranchId, aggregate_id: AggregateId, sequence_number: u64) {
        if let Ok(mut cursors) = self.inner.write() {
            cursors.insert(
                CursorKey {
                    branch_id,
                    aggregate_id,
                },
                sequence_number,
            );
        }
    }

    /// Reset all cursors (rebuild support).
    pub fn clear(&self) {
        if let Ok(mut cursors) = self.inner.write() {
            cursors.clear();
        }
    }
}

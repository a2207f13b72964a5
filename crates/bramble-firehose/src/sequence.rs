//! Sequence tracking for cursor-based resumption.

use crate::error::NonMonotonicSequence;

/// Outcome of observing a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceVerdict {
    /// The sequence advanced the cursor.
    Accepted,
    /// The sequence was at or below the cursor. The cursor is unchanged.
    Rejected(NonMonotonicSequence),
}

impl SequenceVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SequenceVerdict::Accepted)
    }
}

/// Tracks the last accepted sequence number of a stream.
///
/// Unlike a plain `fetch_max`, a regression is reported back to the caller
/// so that duplicates and reordering are visible instead of silently eaten.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last_good: Option<i64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a previously persisted sequence.
    pub fn starting_at(last_good: Option<i64>) -> Self {
        Self { last_good }
    }

    /// Record a sequence number.
    pub fn observe(&mut self, sequence: i64) -> SequenceVerdict {
        match self.last_good {
            Some(last_good) if sequence <= last_good => {
                SequenceVerdict::Rejected(NonMonotonicSequence {
                    sequence,
                    last_good,
                })
            }
            _ => {
                self.last_good = Some(sequence);
                SequenceVerdict::Accepted
            }
        }
    }

    /// The last accepted sequence, to be sent as `cursor` on reconnect.
    pub fn current_cursor(&self) -> Option<i64> {
        self.last_good
    }
}

//! Retention policies for checkpoint and snapshot history.
//!
//! A policy is a pure decision function: given a newest-first list of
//! creation times it partitions the indices into a keep-set and a delete-set.
//! Actually deleting records is the store's job, never this module's.

use chrono::{DateTime, Duration, Utc};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep only the newest record.
    LatestOnly,
    /// Keep the newest `n` records.
    LastN(usize),
    /// Keep everything; pruning under this policy is a no-op.
    FullHistory,
    /// Keep records created within the given window of `now`.
    TimeBased(Duration),
}

/// Disjoint keep/delete index sets over the evaluated list, both in input
/// (newest-first) order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionDecision {
    pub keep: Vec<usize>,
    pub delete: Vec<usize>,
}

impl RetentionPolicy {
    /// Partition `created_at` (newest first) into keep and delete indices.
    pub fn partition(
        &self,
        created_at: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> RetentionDecision {
        let mut decision = RetentionDecision::default();
        for (i, ts) in created_at.iter().enumerate() {
            let keep = match self {
                Self::LatestOnly => i == 0,
                Self::LastN(n) => i < *n,
                Self::FullHistory => true,
                Self::TimeBased(window) => *ts >= now - *window,
            };
            if keep {
                decision.keep.push(i);
            } else {
                decision.delete.push(i);
            }
        }
        decision
    }

    /// True when pruning under this policy can never delete anything.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::FullHistory)
    }
}

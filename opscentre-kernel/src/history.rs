use crate::aggregator::AggregateSnapshot;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;

/// Bounded in-memory history of aggregate snapshots, oldest first.
pub struct AggregateHistory {
    capacity: usize,
    entries: RwLock<VecDeque<AggregateSnapshot>>,
}

impl AggregateHistory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: RwLock::new(VecDeque::with_capacity(capacity.max(1))) }
    }

    pub fn record(&self, snapshot: AggregateSnapshot) {
        let mut entries = self.entries.write();
        entries.push_back(snapshot);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Snapshots with `from <= timestamp <= to`, keeping the most recent `limit`.
    pub fn range(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<AggregateSnapshot> {
        let entries = self.entries.read();
        let matching: Vec<&AggregateSnapshot> = entries
            .iter()
            .filter(|s| from.map_or(true, |f| s.timestamp >= f))
            .filter(|s| to.map_or(true, |t| s.timestamp <= t))
            .collect();
        let skip = limit.map_or(0, |l| matching.len().saturating_sub(l));
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<AggregateSnapshot> {
        self.entries.read().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

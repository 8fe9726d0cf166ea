//! Bounded history of recent container lifecycle actions
//!
//! Kept for statistics only; it is never consulted when routing.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One processed lifecycle action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub action: String,
}

/// Append-only ring buffer capped by entry count and by age
#[derive(Debug)]
pub struct EventHistory {
    entries: Mutex<VecDeque<EventRecord>>,
    capacity: usize,
    retention: chrono::Duration,
}

pub type SharedHistory = Arc<EventHistory>;

impl EventHistory {
    pub fn new(capacity: usize, retention: Duration) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            retention: chrono::Duration::from_std(retention)
                .unwrap_or(chrono::Duration::MAX),
        })
    }

    /// Oldest timestamp still inside the retention window
    fn horizon(&self) -> DateTime<Utc> {
        Utc::now()
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Record an action at the current time
    pub fn record(&self, action: impl Into<String>) {
        self.record_at(Utc::now(), action);
    }

    pub fn record_at(&self, timestamp: DateTime<Utc>, action: impl Into<String>) {
        let mut entries = self.entries.lock();
        entries.push_back(EventRecord {
            timestamp,
            action: action.into(),
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        let horizon = self.horizon();
        Self::prune(&mut entries, horizon);
    }

    /// Actions recorded at or after `cutoff`, oldest first
    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<EventRecord> {
        let mut entries = self.entries.lock();
        let horizon = self.horizon();
        Self::prune(&mut entries, horizon);
        entries
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// All retained actions, oldest first
    pub fn all(&self) -> Vec<EventRecord> {
        self.since(DateTime::<Utc>::MIN_UTC)
    }

    pub fn count_since(&self, cutoff: DateTime<Utc>) -> usize {
        self.since(cutoff).len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Entries are appended in arrival order, so expired ones sit at the front
    // unless a caller supplied an out-of-order timestamp; those are swept too.
    fn prune(entries: &mut VecDeque<EventRecord>, oldest_allowed: DateTime<Utc>) {
        while entries
            .front()
            .is_some_and(|e| e.timestamp < oldest_allowed)
        {
            entries.pop_front();
        }
        if entries.iter().any(|e| e.timestamp < oldest_allowed) {
            entries.retain(|e| e.timestamp >= oldest_allowed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_record_and_query() {
        let history = EventHistory::new(10, DAY);
        history.record("start");
        history.record("die");

        let all = history.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].action, "start");
        assert_eq!(all[1].action, "die");
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let history = EventHistory::new(3, DAY);
        for action in ["create", "start", "stop", "die", "destroy"] {
            history.record(action);
        }

        let actions: Vec<String> = history.all().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["stop", "die", "destroy"]);
        assert_eq!(history.capacity(), 3);
    }

    #[test]
    fn test_since_cutoff() {
        let history = EventHistory::new(10, DAY);
        let now = Utc::now();
        history.record_at(now - chrono::Duration::minutes(30), "start");
        history.record_at(now - chrono::Duration::minutes(10), "stop");
        history.record_at(now, "start");

        let recent = history.since(now - chrono::Duration::minutes(15));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "stop");
        assert_eq!(history.count_since(now), 1);
    }

    #[test]
    fn test_retention_prunes_expired() {
        let history = EventHistory::new(10, Duration::from_secs(60));
        let now = Utc::now();
        history.record_at(now - chrono::Duration::minutes(5), "start");
        history.record_at(now, "stop");

        let all = history.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].action, "stop");
    }

    #[test]
    fn test_huge_retention_keeps_everything() {
        let history = EventHistory::new(10, Duration::from_secs(10_000_000_000_000));
        history.record_at(DateTime::<Utc>::MIN_UTC, "create");
        history.record("start");

        assert_eq!(history.len(), 2);
        assert_eq!(history.all().len(), 2);

        let history = EventHistory::new(10, Duration::MAX);
        history.record("start");
        assert_eq!(history.count_since(DateTime::<Utc>::MIN_UTC), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let history = EventHistory::new(0, DAY);
        history.record("start");
        history.record("stop");
        assert_eq!(history.len(), 1);
    }
}

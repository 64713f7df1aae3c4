use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;

/// A value that was superseded by a write, and when.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// The value before the change. `None` when the key had no value yet.
    pub previous_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// An error caught and swallowed by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    /// The store operation during which the error was caught.
    pub operation: String,
    pub key: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Narrows a history read to the most recent entries or to a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` of the newest entries.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Keep only entries recorded at or after `since`.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub(crate) fn apply<'a>(
        &self,
        entries: impl Iterator<Item = &'a HistoryEntry>,
    ) -> Vec<HistoryEntry> {
        let since = self.since;
        entries
            .filter(|entry| since.map_or(true, |since| entry.timestamp >= since))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

/// A fixed-capacity ring, newest entry first.
///
/// Pushing onto a full log evicts the oldest entry.
#[derive(Debug, Clone)]
pub(crate) struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(16)),
            capacity,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> BoundedLog<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

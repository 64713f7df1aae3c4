use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::history::{BoundedLog, ErrorRecord, HistoryEntry};
use crate::subscription::Subscription;
use crate::sync::lock;

/// A change waiting to be delivered.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    pub key: String,
    pub value: Option<Value>,
    pub previous: Option<Value>,
}

/// All mutable store state, guarded by a single mutex.
pub(crate) struct StoreInner {
    config: StoreConfig,
    values: HashMap<String, Value>,
    frozen: HashSet<String>,
    history: HashMap<String, BoundedLog<HistoryEntry>>,
    // Keys with no subscribers have no entry here.
    subscribers: HashMap<String, Vec<Arc<Subscription>>>,
    // `Some` while a batch is open; kept in first-touched order.
    staged: Option<Vec<Change>>,
    errors: BoundedLog<ErrorRecord>,
    next_subscription_id: u64,
}

impl StoreInner {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            errors: BoundedLog::new(config.max_error_log),
            config,
            values: HashMap::new(),
            frozen: HashSet::new(),
            history: HashMap::new(),
            subscribers: HashMap::new(),
            staged: None,
            next_subscription_id: 0,
        }
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn ensure_writable(&self, key: &str) -> Result<()> {
        if self.frozen.contains(key) {
            return Err(StoreError::FrozenKey(key.to_string()));
        }
        Ok(())
    }

    pub fn is_frozen(&self, key: &str) -> bool {
        self.frozen.contains(key)
    }

    pub fn freeze(&mut self, key: &str) {
        if self.frozen.insert(key.to_string()) {
            debug!(key = %key, "key frozen");
        }
    }

    pub fn unfreeze(&mut self, key: &str) {
        if self.frozen.remove(key) {
            debug!(key = %key, "key unfrozen");
        }
    }

    /// Store `value` under `key` unless it equals the current value.
    ///
    /// Returns the change to deliver now, if any; staged and silent writes
    /// return `None`.
    pub fn install(&mut self, key: &str, value: Value, notify: bool) -> Option<Change> {
        if self.values.get(key) == Some(&value) {
            return None;
        }
        let previous = self.values.insert(key.to_string(), value.clone());
        self.push_history(key, previous.clone());
        debug!(key = %key, "value set");
        self.route(key, Some(value), previous, notify)
    }

    /// Delete the value and history under `key`.
    pub fn take(&mut self, key: &str, notify: bool) -> Option<Change> {
        self.history.remove(key);
        let previous = self.values.remove(key)?;
        debug!(key = %key, "value removed");
        self.route(key, None, Some(previous), notify)
    }

    /// Every key holding a value or history that is not frozen.
    pub fn removable_keys(&self) -> Vec<String> {
        let keys: BTreeSet<&String> = self.values.keys().chain(self.history.keys()).collect();
        keys.into_iter()
            .filter(|key| !self.frozen.contains(*key))
            .cloned()
            .collect()
    }

    fn route(
        &mut self,
        key: &str,
        value: Option<Value>,
        previous: Option<Value>,
        notify: bool,
    ) -> Option<Change> {
        if let Some(staged) = self.staged.as_mut() {
            // Last write wins, but the pre-batch previous value is kept.
            match staged.iter_mut().find(|change| change.key == key) {
                Some(change) => change.value = value,
                None => staged.push(Change {
                    key: key.to_string(),
                    value,
                    previous,
                }),
            }
            return None;
        }
        notify.then(|| Change {
            key: key.to_string(),
            value,
            previous,
        })
    }

    fn push_history(&mut self, key: &str, previous: Option<Value>) {
        if self.config.max_history == 0 {
            return;
        }
        let max_history = self.config.max_history;
        self.history
            .entry(key.to_string())
            .or_insert_with(|| BoundedLog::new(max_history))
            .push(HistoryEntry {
                previous_value: previous,
                timestamp: Utc::now(),
            });
    }

    pub fn history(&self, key: &str) -> Option<&BoundedLog<HistoryEntry>> {
        self.history.get(key)
    }

    pub fn clear_history(&mut self, key: Option<&str>) {
        match key {
            Some(key) => {
                self.history.remove(key);
            }
            None => self.history.clear(),
        }
    }

    /// Open a batch. Returns `false` if one was already open.
    pub fn start_batch(&mut self) -> bool {
        if self.staged.is_some() {
            return false;
        }
        self.staged = Some(Vec::new());
        debug!("batch started");
        true
    }

    /// Close the batch and hand back its staged changes.
    ///
    /// Changes to keys frozen since they were staged are dropped; the values
    /// stay written but the keys stay silent until unfrozen.
    pub fn end_batch(&mut self) -> Option<Vec<Change>> {
        let mut staged = self.staged.take()?;
        staged.retain(|change| !self.frozen.contains(&change.key));
        debug!(changes = staged.len(), "batch ended");
        Some(staged)
    }

    pub fn is_batching(&self) -> bool {
        self.staged.is_some()
    }

    pub fn next_subscription_id(&mut self) -> u64 {
        self.next_subscription_id += 1;
        self.next_subscription_id
    }

    pub fn add_subscription(&mut self, key: &str, subscription: Arc<Subscription>) {
        self.subscribers
            .entry(key.to_string())
            .or_default()
            .push(subscription);
    }

    pub fn remove_subscription(&mut self, key: &str, id: u64) {
        if let Some(subscriptions) = self.subscribers.get_mut(key) {
            subscriptions.retain(|subscription| subscription.id() != id);
            if subscriptions.is_empty() {
                self.subscribers.remove(key);
            }
        }
    }

    /// Snapshot of the active subscriptions for `key`.
    pub fn active_subscriptions(&self, key: &str) -> Option<Vec<Arc<Subscription>>> {
        let subscriptions = self.subscribers.get(key)?;
        Some(
            subscriptions
                .iter()
                .filter(|subscription| subscription.is_active())
                .cloned()
                .collect(),
        )
    }

    /// Drop inactive subscriptions for `key`, and the key's entry if none remain.
    pub fn sweep(&mut self, key: &str) {
        if let Some(subscriptions) = self.subscribers.get_mut(key) {
            subscriptions.retain(|subscription| subscription.is_active());
            if subscriptions.is_empty() {
                self.subscribers.remove(key);
            }
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.get(key).map_or(0, Vec::len)
    }

    pub fn record_error(&mut self, operation: &str, key: Option<&str>, message: String) {
        self.errors.push(ErrorRecord {
            operation: operation.to_string(),
            key: key.map(str::to_string),
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.to_vec()
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut names: BTreeSet<&String> = self.values.keys().collect();
        names.extend(self.history.keys());
        names.extend(self.subscribers.keys());
        names.extend(self.frozen.iter());

        let keys = names
            .into_iter()
            .map(|key| {
                let snapshot = KeySnapshot {
                    has_value: self.values.contains_key(key),
                    frozen: self.frozen.contains(key),
                    history_len: self.history.get(key).map_or(0, BoundedLog::len),
                    subscribers: self.subscriber_count(key),
                };
                (key.clone(), snapshot)
            })
            .collect();

        StoreSnapshot {
            keys,
            batching: self.is_batching(),
            staged: self.staged.as_ref().map_or(0, Vec::len),
            errors: self.errors.len(),
        }
    }
}

/// Debug view of a store's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSnapshot {
    pub keys: BTreeMap<String, KeySnapshot>,
    pub batching: bool,
    pub staged: usize,
    pub errors: usize,
}

/// Per-key part of a [`StoreSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySnapshot {
    pub has_value: bool,
    pub frozen: bool,
    pub history_len: usize,
    pub subscribers: usize,
}

/// Appends caught errors to a store's error log without keeping it alive.
#[derive(Clone)]
pub(crate) struct Reporter {
    inner: Weak<Mutex<StoreInner>>,
}

impl Reporter {
    pub fn new(inner: &Arc<Mutex<StoreInner>>) -> Self {
        Self {
            inner: Arc::downgrade(inner),
        }
    }

    #[cfg(test)]
    pub fn detached() -> Self {
        Self { inner: Weak::new() }
    }

    pub fn record(&self, operation: &str, key: Option<&str>, message: String) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner).record_error(operation, key, message);
        }
    }
}

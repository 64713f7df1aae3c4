use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use super::inner::{StoreInner, StoreSnapshot};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::history::{ErrorRecord, HistoryEntry, HistoryQuery};
use crate::subscription::{Notification, SubscribeOptions, Subscription, SubscriptionHandle};
use crate::sync::lock;
use crate::value::{field, merge, validate_key};

/// A keyed state container with change notification.
///
/// `Store` is a cheap handle: clones share the same state, so one store can be
/// constructed at startup and handed to every component that needs it.
///
/// Writes whose value is structurally equal to the current one are no-ops: no
/// history entry, no notification. Callbacks run without any store lock held,
/// so they may freely read and write the store, including the key that
/// triggered them.
///
/// # Examples
///
/// ```
/// use statehold::Store;
/// use serde_json::json;
/// use std::sync::{Arc, Mutex};
///
/// let store = Store::new();
/// store.set("tree_state", json!({ "filter": "" })).unwrap();
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let seen_clone = seen.clone();
/// store.subscribe("tree_state", move |new, old, _| {
///     seen_clone.lock().unwrap().push((new.cloned(), old.cloned()));
/// });
///
/// store.update("tree_state", json!({ "filter": "x" })).unwrap();
///
/// let seen = seen.lock().unwrap();
/// assert_eq!(seen.len(), 1);
/// assert_eq!(seen[0].0, Some(json!({ "filter": "x" })));
/// assert_eq!(seen[0].1, Some(json!({ "filter": "" })));
/// ```
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<Mutex<StoreInner>>,
}

/// A non-owning handle to a [`Store`], for callbacks that write back.
///
/// A subscription is owned by its store, so a callback that captures a
/// `Store` clone keeps the store alive until it unsubscribes. Capture a
/// `WeakStore` instead and upgrade it on each call.
#[derive(Clone)]
pub struct WeakStore {
    inner: Weak<Mutex<StoreInner>>,
}

impl WeakStore {
    /// The store, if any strong handle to it is still alive.
    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create an empty store with default limits.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::new(config))),
        }
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Log and record a failed read or subscribe.
    fn reject(&self, operation: &str, key: &str, err: StoreError) {
        warn!(operation, key = %key, error = %err, "store operation rejected");
        lock(&self.inner).record_error(operation, Some(key), err.to_string());
    }

    /// Get a copy of the value under `key`.
    ///
    /// An invalid key is logged and reads as `None`.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Err(err) = validate_key(key) {
            self.reject("get", key, err);
            return None;
        }
        lock(&self.inner).value(key).cloned()
    }

    /// Get one property of the mapping stored under `key`.
    pub fn get_field(&self, key: &str, sub_key: &str) -> Option<Value> {
        if let Err(err) = validate_key(key) {
            self.reject("get", key, err);
            return None;
        }
        let inner = lock(&self.inner);
        inner
            .value(key)
            .and_then(|value| field(value, sub_key))
            .cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        if let Err(err) = validate_key(key) {
            self.reject("has", key, err);
            return false;
        }
        lock(&self.inner).value(key).is_some()
    }

    pub fn has_field(&self, key: &str, sub_key: &str) -> bool {
        if let Err(err) = validate_key(key) {
            self.reject("has", key, err);
            return false;
        }
        let inner = lock(&self.inner);
        inner
            .value(key)
            .and_then(|value| field(value, sub_key))
            .is_some()
    }

    /// Read the value under `key` as a typed slice.
    ///
    /// A value that does not deserialize into `T` is logged and reads as `None`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                self.reject("get_as", key, err.into());
                None
            }
        }
    }

    /// Keys currently holding a value, sorted.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.inner).keys()
    }

    /// Replace the value under `key` and notify subscribers.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.set_with(key, value, true)
    }

    /// Replace the value under `key`, notifying only if `notify` is set.
    ///
    /// Inside a batch the change is staged regardless of `notify`.
    pub fn set_with(&self, key: &str, value: impl Into<Value>, notify: bool) -> Result<()> {
        validate_key(key)?;
        let value = value.into();
        let change = {
            let mut inner = lock(&self.inner);
            inner.ensure_writable(key)?;
            inner.install(key, value, notify)
        };
        if let Some(change) = change {
            self.dispatch(change);
        }
        Ok(())
    }

    /// Store a typed slice under `key`.
    pub fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, serde_json::to_value(value)?)
    }

    /// Shallow-merge the mapping `partial` onto the value under `key`.
    ///
    /// An absent key merges onto an empty mapping. Fails with
    /// [`StoreError::NotAnObject`] if the current value is not a mapping or
    /// `partial` is not one.
    pub fn update(&self, key: &str, partial: Value) -> Result<()> {
        self.update_with(key, partial, true)
    }

    pub fn update_with(&self, key: &str, partial: Value, notify: bool) -> Result<()> {
        validate_key(key)?;
        let change = {
            let mut inner = lock(&self.inner);
            inner.ensure_writable(key)?;
            let merged = merge(key, inner.value(key), partial)?;
            inner.install(key, merged, notify)
        };
        if let Some(change) = change {
            self.dispatch(change);
        }
        Ok(())
    }

    /// Delete the value and history under `key`.
    ///
    /// Subscribers see a `None` new value. Removing an absent key is a no-op.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.remove_with(key, true)
    }

    pub fn remove_with(&self, key: &str, notify: bool) -> Result<()> {
        validate_key(key)?;
        let change = {
            let mut inner = lock(&self.inner);
            inner.ensure_writable(key)?;
            inner.take(key, notify)
        };
        if let Some(change) = change {
            self.dispatch(change);
        }
        Ok(())
    }

    /// Remove `key`, or with `None` every key that is not frozen.
    pub fn clear(&self, key: Option<&str>) -> Result<()> {
        self.clear_with(key, true)
    }

    pub fn clear_with(&self, key: Option<&str>, notify: bool) -> Result<()> {
        if let Some(key) = key {
            return self.remove_with(key, notify);
        }

        let changes: Vec<_> = {
            let mut inner = lock(&self.inner);
            inner
                .removable_keys()
                .into_iter()
                .filter_map(|key| inner.take(&key, notify))
                .collect()
        };
        debug!(removed = changes.len(), "store cleared");
        for change in changes {
            self.dispatch(change);
        }
        Ok(())
    }

    /// Reject every write to `key` until it is unfrozen. Does not notify.
    pub fn freeze(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        lock(&self.inner).freeze(key);
        Ok(())
    }

    pub fn unfreeze(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        lock(&self.inner).unfreeze(key);
        Ok(())
    }

    pub fn is_frozen(&self, key: &str) -> bool {
        lock(&self.inner).is_frozen(key)
    }

    /// Start staging changes instead of delivering them.
    ///
    /// Batches do not nest: starting a batch while one is open does nothing.
    pub fn start_batch(&self) {
        lock(&self.inner).start_batch();
    }

    /// Close the open batch and deliver one coalesced change per touched key,
    /// carrying the value from before the batch and the final value.
    ///
    /// Does nothing if no batch is open. Writes made by subscribers during the
    /// flush are delivered immediately.
    pub fn end_batch(&self) {
        let staged = lock(&self.inner).end_batch();
        if let Some(staged) = staged {
            self.flush(staged);
        }
    }

    /// Run `f` inside a batch.
    ///
    /// If a batch is already open, `f` joins it and the outer owner ends it.
    /// A batch opened here is ended even if `f` panics.
    ///
    /// ```
    /// use statehold::Store;
    ///
    /// let store = Store::new();
    /// store.batch(|store| {
    ///     store.set("a", 1).unwrap();
    ///     store.set("b", 2).unwrap();
    ///     assert!(store.is_batching());
    /// });
    /// assert!(!store.is_batching());
    /// ```
    pub fn batch<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Self) -> R,
    {
        let opened = lock(&self.inner).start_batch();
        let result = catch_unwind(AssertUnwindSafe(|| f(self)));
        if opened {
            self.end_batch();
        }
        match result {
            Ok(value) => value,
            Err(payload) => resume_unwind(payload),
        }
    }

    pub fn is_batching(&self) -> bool {
        lock(&self.inner).is_batching()
    }

    /// Call `callback` with `(new, old, notification)` on every change to `key`.
    ///
    /// The store owns the callback until it is unsubscribed. A callback that
    /// captures a `Store` clone forms a cycle and the store is never freed;
    /// capture [`Store::downgrade`] instead.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(Option<&Value>, Option<&Value>, &Notification) + Send + Sync + 'static,
    {
        self.subscribe_with(key, SubscribeOptions::default(), callback)
    }

    /// Subscribe with filter, debounce, once and immediate policies.
    ///
    /// An invalid key is logged and yields an inert handle.
    pub fn subscribe_with<F>(
        &self,
        key: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> SubscriptionHandle
    where
        F: Fn(Option<&Value>, Option<&Value>, &Notification) + Send + Sync + 'static,
    {
        if let Err(err) = validate_key(key) {
            self.reject("subscribe", key, err);
            return SubscriptionHandle::inert();
        }

        let (subscription, current) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_subscription_id();
            let subscription = Arc::new(Subscription::new(id, key, Box::new(callback), &options));
            inner.add_subscription(key, Arc::clone(&subscription));
            (subscription, inner.value(key).cloned())
        };
        debug!(key = %key, subscription = subscription.id(), "subscribed");
        let handle = SubscriptionHandle::new(key, Arc::downgrade(&self.inner), &subscription);

        if let (true, Some(current)) = (options.is_immediate(), current) {
            let notification = Arc::new(Notification {
                key: key.to_string(),
                value: Some(current),
                previous_value: None,
                timestamp: Utc::now(),
            });
            self.deliver_all(std::slice::from_ref(&subscription), &notification);
            lock(&self.inner).sweep(key);
        }

        handle
    }

    /// Number of subscriptions registered for `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        lock(&self.inner).subscriber_count(key)
    }

    /// Values superseded under `key`, newest first.
    pub fn get_history(&self, key: &str, query: HistoryQuery) -> Vec<HistoryEntry> {
        if let Err(err) = validate_key(key) {
            self.reject("get_history", key, err);
            return Vec::new();
        }
        let inner = lock(&self.inner);
        inner
            .history(key)
            .map(|log| query.apply(log.iter()))
            .unwrap_or_default()
    }

    /// Drop history for `key`, or for every key. Values are untouched.
    pub fn clear_history(&self, key: Option<&str>) {
        lock(&self.inner).clear_history(key);
    }

    /// Errors caught by the store, newest first.
    pub fn error_log(&self) -> Vec<ErrorRecord> {
        lock(&self.inner).errors()
    }

    pub fn clear_error_log(&self) {
        lock(&self.inner).clear_errors();
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        lock(&self.inner).snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(store: &Store, key: &str) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        store.subscribe(key, move |_, _, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        calls
    }

    #[test]
    fn store_get_set() {
        let store = Store::new();
        assert_eq!(store.get("count"), None);

        store.set("count", 42).unwrap();
        assert_eq!(store.get("count"), Some(json!(42)));
        assert!(store.has("count"));
        assert!(!store.has("missing"));
    }

    #[test]
    fn weak_handle_does_not_keep_store_alive() {
        let store = Store::new();
        let weak = store.downgrade();
        let writer = store.downgrade();
        store.subscribe("a", move |new, _, _| {
            if let Some(store) = writer.upgrade() {
                store.set("b", new.cloned().unwrap_or(Value::Null)).unwrap();
            }
        });

        store.set("a", 1).unwrap();
        assert_eq!(store.get("b"), Some(json!(1)));
        assert!(weak.upgrade().is_some());

        drop(store);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn returned_values_are_copies() {
        let store = Store::new();
        store.set("list", json!([1, 2])).unwrap();

        let mut copy = store.get("list").unwrap();
        copy.as_array_mut().unwrap().push(json!(3));

        assert_eq!(store.get("list"), Some(json!([1, 2])));
    }

    #[test]
    fn fields_address_into_mappings() {
        let store = Store::new();
        store.set("modals_state", json!({ "active": ["confirm"] })).unwrap();
        store.set("count", 1).unwrap();

        assert_eq!(
            store.get_field("modals_state", "active"),
            Some(json!(["confirm"]))
        );
        assert!(store.has_field("modals_state", "active"));
        assert!(!store.has_field("modals_state", "stack"));
        assert!(!store.has_field("count", "anything"));
        assert_eq!(store.get_field("missing", "active"), None);
    }

    #[test]
    fn invalid_key_reads_degrade_and_are_logged() {
        let store = Store::new();
        assert_eq!(store.get(""), None);
        assert!(!store.has(""));
        assert!(store.get_history("", HistoryQuery::new()).is_empty());

        let handle = store.subscribe("", |_, _, _| {});
        assert!(!handle.is_active());

        let errors = store.error_log();
        assert_eq!(errors.len(), 4);
        assert_eq!(errors[0].operation, "subscribe");
        assert_eq!(errors[3].operation, "get");

        store.clear_error_log();
        assert!(store.error_log().is_empty());
    }

    #[test]
    fn invalid_key_writes_propagate() {
        let store = Store::new();
        assert!(matches!(store.set("", 1), Err(StoreError::InvalidKey)));
        assert!(matches!(
            store.update("", json!({})),
            Err(StoreError::InvalidKey)
        ));
        assert!(matches!(store.remove(""), Err(StoreError::InvalidKey)));
        assert!(matches!(store.freeze(""), Err(StoreError::InvalidKey)));
        assert!(store.error_log().is_empty());
    }

    #[test]
    fn store_update() {
        let store = Store::new();
        store.update("form", json!({ "name": "a" })).unwrap();
        store.update("form", json!({ "dirty": true })).unwrap();
        assert_eq!(store.get("form"), Some(json!({ "name": "a", "dirty": true })));
    }

    #[test]
    fn update_rejects_scalar_target() {
        let store = Store::new();
        store.set("count", 3).unwrap();
        assert!(matches!(
            store.update("count", json!({ "a": 1 })),
            Err(StoreError::NotAnObject(key)) if key == "count"
        ));
        assert_eq!(store.get("count"), Some(json!(3)));
    }

    #[test]
    fn silent_writes_record_history_without_notifying() {
        let store = Store::new();
        let calls = counter(&store, "k");

        store.set_with("k", 1, false).unwrap();
        store.update_with("obj", json!({ "a": 1 }), false).unwrap();
        store.remove_with("k", false).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get_history("obj", HistoryQuery::new()).len(), 1);
    }

    #[test]
    fn frozen_key_rejects_writes() {
        let store = Store::new();
        store.set("k", 1).unwrap();
        store.freeze("k").unwrap();
        assert!(store.is_frozen("k"));

        assert!(matches!(store.set("k", 2), Err(StoreError::FrozenKey(_))));
        assert!(matches!(
            store.update("k", json!({})),
            Err(StoreError::FrozenKey(_))
        ));
        assert!(matches!(store.remove("k"), Err(StoreError::FrozenKey(_))));
        assert!(matches!(
            store.clear(Some("k")),
            Err(StoreError::FrozenKey(_))
        ));
        assert_eq!(store.get("k"), Some(json!(1)));
        assert_eq!(store.get_history("k", HistoryQuery::new()).len(), 1);

        store.unfreeze("k").unwrap();
        store.set("k", 2).unwrap();
        assert_eq!(store.get("k"), Some(json!(2)));
    }

    #[test]
    fn remove_deletes_value_and_history() {
        let store = Store::new();
        store.set("k", 1).unwrap();
        store.set("k", 2).unwrap();

        store.remove("k").unwrap();
        assert!(!store.has("k"));
        assert!(store.get_history("k", HistoryQuery::new()).is_empty());
    }

    #[test]
    fn clear_all_spares_frozen_keys() {
        let store = Store::new();
        store.set("a", 1).unwrap();
        store.set("b", 2).unwrap();
        store.freeze("b").unwrap();
        let calls = counter(&store, "a");

        store.clear(None).unwrap();

        assert_eq!(store.keys(), vec!["b".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("b"), Some(json!(2)));
    }

    #[test]
    fn clear_history_keeps_values() {
        let store = Store::new();
        store.set("a", 1).unwrap();
        store.set("b", 1).unwrap();

        store.clear_history(Some("a"));
        assert!(store.get_history("a", HistoryQuery::new()).is_empty());
        assert_eq!(store.get_history("b", HistoryQuery::new()).len(), 1);

        store.clear_history(None);
        assert!(store.get_history("b", HistoryQuery::new()).is_empty());
        assert_eq!(store.get("a"), Some(json!(1)));
    }

    #[test]
    fn typed_slices_round_trip_through_json() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Pager {
            page: u32,
        }

        let store = Store::new();
        store.set_as("pager", &Pager { page: 2 }).unwrap();
        assert_eq!(store.get("pager"), Some(json!({ "page": 2 })));
        assert_eq!(store.get_as::<Pager>("pager"), Some(Pager { page: 2 }));

        store.set("pager", "not a pager").unwrap();
        assert_eq!(store.get_as::<Pager>("pager"), None);
        assert_eq!(store.error_log()[0].operation, "get_as");
    }

    #[test]
    fn clones_share_state() {
        let store = Store::new();
        let other = store.clone();
        other.set("shared", true).unwrap();
        assert_eq!(store.get("shared"), Some(json!(true)));
    }

    #[test]
    fn snapshot_reports_bookkeeping() {
        let store = Store::new();
        store.set("a", 1).unwrap();
        store.freeze("a").unwrap();
        let _handle = store.subscribe("b", |_, _, _| {});
        store.start_batch();
        store.set("c", 1).unwrap();

        let snapshot = store.snapshot();
        assert!(snapshot.batching);
        assert_eq!(snapshot.staged, 1);
        let a = &snapshot.keys["a"];
        assert!(a.has_value && a.frozen);
        assert_eq!(a.history_len, 1);
        assert_eq!(snapshot.keys["b"].subscribers, 1);
        assert!(!snapshot.keys["b"].has_value);

        store.end_batch();
        assert!(!store.snapshot().batching);
    }

    #[test]
    fn zero_history_cap_records_nothing() {
        let store = Store::with_config(StoreConfig::default().with_max_history(0));
        store.set("k", 1).unwrap();
        store.set("k", 2).unwrap();
        assert!(store.get_history("k", HistoryQuery::new()).is_empty());
    }
}

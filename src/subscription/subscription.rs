use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, trace};

use super::debounce::{Debouncer, TimerStep};
use crate::store::{Reporter, StoreInner};
use crate::sync::lock;

/// A single change delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub key: String,
    /// The value after the change. `None` when the key was removed.
    pub value: Option<Value>,
    /// The value before the change. `None` when the key had no value.
    pub previous_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

pub(crate) type Callback = dyn Fn(Option<&Value>, Option<&Value>, &Notification) + Send + Sync;

type Predicate = dyn Fn(Option<&Value>, Option<&Value>, &Notification) -> bool + Send + Sync;

/// A predicate deciding whether a change reaches a subscriber.
#[derive(Clone)]
pub struct Filter(Arc<Predicate>);

impl Filter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(Option<&Value>, Option<&Value>, &Notification) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    fn matches(&self, notification: &Notification) -> bool {
        (self.0)(
            notification.value.as_ref(),
            notification.previous_value.as_ref(),
            notification,
        )
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Filter(..)")
    }
}

/// Invocation policy for a new subscription.
///
/// # Examples
///
/// ```
/// use statehold::SubscribeOptions;
/// use std::time::Duration;
///
/// let options = SubscribeOptions::new()
///     .debounce(Duration::from_millis(150))
///     .filter(|new, _old, _n| new.is_some())
///     .once();
/// assert!(options.is_once());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    debounce: Option<Duration>,
    filter: Option<Filter>,
    once: bool,
    immediate: bool,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver only after `wait` has passed without another change.
    ///
    /// A zero duration disables debouncing.
    pub fn debounce(mut self, wait: Duration) -> Self {
        self.debounce = (!wait.is_zero()).then_some(wait);
        self
    }

    /// Skip changes the predicate rejects.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(Option<&Value>, Option<&Value>, &Notification) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Filter::new(predicate));
        self
    }

    /// Deactivate after the first delivered change.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Also deliver the key's current value at subscribe time.
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn is_once(&self) -> bool {
        self.once
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }
}

enum Delivery {
    Direct,
    Debounced(Debouncer),
}

/// A registered callback and its policies.
pub(crate) struct Subscription {
    id: u64,
    key: String,
    callback: Box<Callback>,
    filter: Option<Filter>,
    delivery: Delivery,
    once: bool,
    active: AtomicBool,
    last_called: Mutex<Option<DateTime<Utc>>>,
}

impl Subscription {
    pub fn new(id: u64, key: &str, callback: Box<Callback>, options: &SubscribeOptions) -> Self {
        let delivery = match options.debounce {
            Some(wait) => Delivery::Debounced(Debouncer::new(wait)),
            None => Delivery::Direct,
        };
        Self {
            id,
            key: key.to_string(),
            callback,
            filter: options.filter.clone(),
            delivery,
            once: options.once,
            active: AtomicBool::new(true),
            last_called: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn last_called(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_called)
    }

    /// Stop all future deliveries, including a debounced one in flight.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Delivery::Debounced(debouncer) = &self.delivery {
            debouncer.cancel();
        }
    }

    /// Run one notification through filter, delivery and once policies.
    pub fn deliver(self: &Arc<Self>, notification: &Arc<Notification>, reporter: &Reporter) {
        if !self.is_active() {
            return;
        }

        if let Some(filter) = &self.filter {
            match catch_unwind(AssertUnwindSafe(|| filter.matches(notification))) {
                Ok(true) => {}
                Ok(false) => return,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(key = %self.key, subscription = self.id, %message, "subscription filter panicked");
                    reporter.record("filter", Some(&self.key), message);
                    return;
                }
            }
        }

        match &self.delivery {
            Delivery::Direct => self.invoke_once_aware(notification, reporter),
            Delivery::Debounced(debouncer) => {
                if debouncer.schedule(Arc::clone(notification)) {
                    self.start_timer(debouncer, reporter);
                }
            }
        }
    }

    fn start_timer(self: &Arc<Self>, debouncer: &Debouncer, reporter: &Reporter) {
        let subscription = Arc::clone(self);
        let timer_reporter = reporter.clone();
        let spawned = thread::Builder::new()
            .name("statehold-debounce".to_string())
            .spawn(move || subscription.run_timer(&timer_reporter));
        if let Err(err) = spawned {
            debouncer.timer_failed();
            error!(key = %self.key, error = %err, "failed to start debounce timer");
            reporter.record("debounce", Some(&self.key), err.to_string());
        }
    }

    /// Timer side of a debounced delivery: sleep until the quiet window ends.
    fn run_timer(&self, reporter: &Reporter) {
        let Delivery::Debounced(debouncer) = &self.delivery else {
            return;
        };
        loop {
            match debouncer.poll(Instant::now()) {
                TimerStep::Sleep(remaining) => thread::sleep(remaining),
                TimerStep::Fire(notification) => {
                    if self.is_active() {
                        self.invoke_once_aware(&notification, reporter);
                    }
                    return;
                }
                TimerStep::Idle => return,
            }
        }
    }

    fn invoke_once_aware(&self, notification: &Notification, reporter: &Reporter) {
        // Claim before invoking so a re-entrant dispatch cannot fire a `once` twice.
        if self.once && !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.invoke(notification, reporter);
    }

    fn invoke(&self, notification: &Notification, reporter: &Reporter) {
        trace!(key = %self.key, subscription = self.id, "invoking subscriber");
        *lock(&self.last_called) = Some(Utc::now());

        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.callback)(
                notification.value.as_ref(),
                notification.previous_value.as_ref(),
                notification,
            )
        }));
        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            error!(key = %self.key, subscription = self.id, %message, "subscriber panicked");
            reporter.record("notify", Some(&self.key), message);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "subscriber panicked with a non-string payload".to_string()
    }
}

#[derive(Debug, Clone)]
struct Link {
    key: String,
    id: u64,
    store: Weak<Mutex<StoreInner>>,
    subscription: Weak<Subscription>,
}

/// Handle returned by [`Store::subscribe`](crate::Store::subscribe).
///
/// Dropping the handle does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
/// The handle only holds weak references, so it never keeps a store or a
/// callback alive.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionHandle {
    link: Option<Link>,
}

impl SubscriptionHandle {
    /// A handle for a subscription that was never registered.
    pub(crate) fn inert() -> Self {
        Self::default()
    }

    pub(crate) fn new(
        key: &str,
        store: Weak<Mutex<StoreInner>>,
        subscription: &Arc<Subscription>,
    ) -> Self {
        Self {
            link: Some(Link {
                key: key.to_string(),
                id: subscription.id(),
                store,
                subscription: Arc::downgrade(subscription),
            }),
        }
    }

    /// Remove the subscription from its key. Calling this more than once, or
    /// from inside the subscription's own callback, is safe.
    pub fn unsubscribe(&self) {
        let Some(link) = &self.link else {
            return;
        };
        if let Some(subscription) = link.subscription.upgrade() {
            subscription.deactivate();
        }
        if let Some(store) = link.store.upgrade() {
            lock(&store).remove_subscription(&link.key, link.id);
        }
    }

    /// Whether the subscription will still receive notifications.
    pub fn is_active(&self) -> bool {
        self.link
            .as_ref()
            .and_then(|link| link.subscription.upgrade())
            .is_some_and(|subscription| subscription.is_active())
    }

    /// The key this handle is subscribed to, if it was registered.
    pub fn key(&self) -> Option<&str> {
        self.link.as_ref().map(|link| link.key.as_str())
    }

    /// When the callback last ran.
    pub fn last_called(&self) -> Option<DateTime<Utc>> {
        self.link
            .as_ref()
            .and_then(|link| link.subscription.upgrade())
            .and_then(|subscription| subscription.last_called())
    }
}

use chrono::Utc;
use std::sync::Arc;
use tracing::trace;

use super::inner::{Change, Reporter};
use super::Store;
use crate::subscription::{Notification, Subscription};
use crate::sync::lock;

impl Store {
    /// Deliver one change to every active subscriber of its key.
    ///
    /// Subscribers are snapshotted before delivery, so callbacks may subscribe,
    /// unsubscribe or write without disturbing this round. A panicking callback
    /// is contained to itself.
    pub(crate) fn dispatch(&self, change: Change) {
        let Some(subscriptions) = lock(&self.inner).active_subscriptions(&change.key) else {
            return;
        };

        let notification = Arc::new(Notification {
            key: change.key,
            value: change.value,
            previous_value: change.previous,
            timestamp: Utc::now(),
        });
        trace!(
            key = %notification.key,
            subscribers = subscriptions.len(),
            "dispatching change"
        );

        self.deliver_all(&subscriptions, &notification);
        lock(&self.inner).sweep(&notification.key);
    }

    pub(crate) fn deliver_all(
        &self,
        subscriptions: &[Arc<Subscription>],
        notification: &Arc<Notification>,
    ) {
        let reporter = Reporter::new(&self.inner);
        for subscription in subscriptions {
            subscription.deliver(notification, &reporter);
        }
    }

    /// Deliver staged changes in first-touched order.
    ///
    /// A batch that ended where it started delivers nothing for that key.
    pub(crate) fn flush(&self, staged: Vec<Change>) {
        for change in staged {
            if change.value == change.previous {
                continue;
            }
            self.dispatch(change);
        }
    }
}

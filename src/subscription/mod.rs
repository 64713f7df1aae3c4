//! Subscriptions and the policies that decide when their callbacks run.
//!
//! A subscription belongs to one key. Each dispatch for that key passes
//! through the subscription's policies in a fixed order:
//! - `filter`: skip the delivery unless the predicate accepts the change
//! - `debounce`: coalesce bursts into one trailing call carrying the latest change
//! - `once`: deactivate after the first call that actually reaches the callback

mod debounce;
mod subscription;

pub use subscription::{Filter, Notification, SubscribeOptions, SubscriptionHandle};
pub(crate) use subscription::Subscription;

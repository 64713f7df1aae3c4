//! # Statehold
//!
//! A keyed reactive state store for UI components that must share state
//! without knowing about each other.
//!
//! Each component owns a key (see [`slices`]) and writes structured JSON
//! values under it. Other components subscribe to keys and are told about
//! every real change:
//!
//! - `Store` - Get, set, shallow-merge update, remove and clear values
//! - Deep-equality short circuit: writing an equal value does nothing
//! - Batches that coalesce many writes into one notification per key
//! - Frozen keys that reject writes until unfrozen
//! - Bounded per-key history and error log for diagnostics
//!
//! ## Subscriptions
//!
//! Subscriber callbacks receive `(new, old, notification)` and may be
//! filtered, debounced, limited to one call or primed with the current
//! value. Callbacks may write to the store re-entrantly; a panicking
//! callback is logged and never affects other subscribers or the writer.

pub mod config;
pub mod error;
pub mod history;
pub mod slices;
pub mod store;
pub mod subscription;

mod sync;
mod value;

// Re-export main types for convenience
pub use config::{StoreConfig, MAX_HISTORY_SIZE};
pub use error::{Result, StoreError};
pub use history::{ErrorRecord, HistoryEntry, HistoryQuery};
pub use store::{Store, StoreSnapshot, WeakStore};
pub use subscription::{Filter, Notification, SubscribeOptions, SubscriptionHandle};

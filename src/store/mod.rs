//! The keyed state store and its change notifier.
//!
//! A [`Store`] maps string keys to JSON values. Writes are diff-checked,
//! recorded in a bounded per-key history and either delivered to subscribers
//! right away or staged in the active batch and delivered, coalesced, when the
//! batch ends.

mod inner;
mod notifier;
mod store;

pub(crate) use inner::{Reporter, StoreInner};
pub use inner::{KeySnapshot, StoreSnapshot};
pub use store::{Store, WeakStore};

//! Bounded, newest-first logs of superseded values and caught errors.
//!
//! History is diagnostic only: it records what each write replaced so a
//! developer can inspect how a key evolved, but it is never replayed.

mod history;

pub use history::{ErrorRecord, HistoryEntry, HistoryQuery};
pub(crate) use history::BoundedLog;

//! Well-known keys and typed shapes for the UI components sharing a store.
//!
//! Each component owns one namespaced key and reads or writes it through
//! [`Store::get_as`](crate::Store::get_as) and [`Store::set_as`](crate::Store::set_as).
//! Other components subscribe to those keys to react to each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const TREE_STATE: &str = "tree_state";
pub const FORMS_STATE: &str = "forms_state";
pub const MODALS_STATE: &str = "modals_state";
pub const API_STATUS: &str = "api_status";

/// State of the hierarchical record tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeState {
    /// Text typed into the tree's filter input.
    pub filter: String,
    /// Ids of nodes whose children are shown.
    pub expanded: BTreeSet<String>,
    pub selected: Option<String>,
    /// Pagination cursor per parent node id.
    pub cursors: BTreeMap<String, String>,
}

impl TreeState {
    /// Expand a collapsed node or collapse an expanded one. Returns whether
    /// the node is now expanded.
    pub fn toggle(&mut self, node_id: &str) -> bool {
        if self.expanded.remove(node_id) {
            false
        } else {
            self.expanded.insert(node_id.to_string());
            true
        }
    }
}

/// State of one open form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormState {
    pub values: Map<String, Value>,
    /// Validation message per field name.
    pub errors: BTreeMap<String, String>,
    pub dirty: bool,
    pub submitting: bool,
}

/// All open forms, by form id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormsState {
    pub forms: BTreeMap<String, FormState>,
}

/// Stack of open modals; the last id is on top.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModalsState {
    pub active: Vec<String>,
}

impl ModalsState {
    pub fn top(&self) -> Option<&str> {
        self.active.last().map(String::as_str)
    }

    /// Open `modal_id`, moving it to the top if it is already open.
    pub fn open(&mut self, modal_id: &str) {
        self.active.retain(|id| id != modal_id);
        self.active.push(modal_id.to_string());
    }

    pub fn close(&mut self, modal_id: &str) -> bool {
        let before = self.active.len();
        self.active.retain(|id| id != modal_id);
        self.active.len() != before
    }
}

/// Outcome of the API client's most recent request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiStatus {
    pub loading: bool,
    pub error: Option<String>,
    pub last_response: Option<Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ApiStatus {
    pub fn started() -> Self {
        Self {
            loading: true,
            updated_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn succeeded(response: Value) -> Self {
        Self {
            last_response: Some(response),
            updated_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            updated_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

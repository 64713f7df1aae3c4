//! Store configuration.

use serde::Deserialize;

use crate::error::Result;

/// Default number of prior values kept per key.
pub const MAX_HISTORY_SIZE: usize = 50;

/// Default number of caught errors kept for diagnostics.
pub const MAX_ERROR_LOG_SIZE: usize = 50;

/// Limits applied by a [`Store`](crate::Store).
///
/// A cap of zero disables recording for that log entirely.
///
/// ```
/// use statehold::StoreConfig;
///
/// let config = StoreConfig::from_json_str(r#"{ "max_history": 10 }"#).unwrap();
/// assert_eq!(config.max_history, 10);
/// assert_eq!(config.max_error_log, statehold::config::MAX_ERROR_LOG_SIZE);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum history entries retained per key.
    pub max_history: usize,
    /// Maximum entries retained in the error log.
    pub max_error_log: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_history: MAX_HISTORY_SIZE,
            max_error_log: MAX_ERROR_LOG_SIZE,
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn with_max_error_log(mut self, max_error_log: usize) -> Self {
        self.max_error_log = max_error_log;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = StoreConfig::default();
        assert_eq!(config.max_history, MAX_HISTORY_SIZE);
        assert_eq!(config.max_error_log, MAX_ERROR_LOG_SIZE);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = StoreConfig::from_json_str(r#"{ "max_error_log": 3 }"#).unwrap();
        assert_eq!(config.max_history, MAX_HISTORY_SIZE);
        assert_eq!(config.max_error_log, 3);
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(StoreConfig::from_json_str("{ max_history: ").is_err());
    }
}

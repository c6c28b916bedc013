//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Settings for one store instance.
///
/// Missing fields fall back to their defaults when loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub store_id: String,
    /// Written to every locally committed event.
    pub client_id: String,
    pub session_id: String,
    /// Hash materializer output and compare it with hashes attached to
    /// pulled and replayed events. On in debug builds.
    pub verify_materializer_hashes: bool,
    /// Size of the ring buffer of recent refreshes kept for devtools.
    pub recent_refreshes_capacity: usize,
    /// Number of pulled batches the inbox buffers before senders wait.
    pub inbox_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_id: "default".to_string(),
            client_id: "client-0".to_string(),
            session_id: "session-0".to_string(),
            verify_materializer_hashes: cfg!(debug_assertions),
            recent_refreshes_capacity: 128,
            inbox_capacity: 64,
        }
    }
}

impl StoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, StoreError> {
        let config: Self = serde_json::from_str(json).map_err(|err| StoreError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.store_id.is_empty() {
            return Err(StoreError::Config("store_id must not be empty".to_string()));
        }
        if self.client_id.is_empty() {
            return Err(StoreError::Config("client_id must not be empty".to_string()));
        }
        if self.inbox_capacity == 0 {
            return Err(StoreError::Config("inbox_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config = StoreConfig::from_json_str(r#"{ "store_id": "issues", "inbox_capacity": 8 }"#).unwrap();
        assert_eq!(config.store_id, "issues");
        assert_eq!(config.inbox_capacity, 8);
        assert_eq!(config.recent_refreshes_capacity, 128);
        assert_eq!(config.client_id, "client-0");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = StoreConfig::from_json_str(r#"{ "store_id": "" }"#).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));

        let err = StoreConfig::from_json_str(r#"{ "inbox_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));

        assert!(StoreConfig::from_json_str("not json").is_err());
    }
}

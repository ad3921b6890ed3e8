//! Session configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub id: String,
    /// Deadline per script turn; each expiry sends one interrupt
    pub exec_timeout_ms: u64,
    /// Silence window that ends a `TrackChanges` drain
    pub quiescence_ms: u64,
    /// Bounded mutation channel capacity
    pub mutation_capacity: usize,
    /// URL the document pretends to live at (`window.location`)
    pub page_url: String,
    /// Value of `Referrer()`; falls back to the fetcher origin
    pub referrer: Option<String>,
    pub memory_limit: Option<usize>,
    pub max_stack_size: Option<usize>,
    /// Write each composed script here before evaluation
    pub dump_script: Option<PathBuf>,
}

impl SessionConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    /// Same settings under a fresh session id
    pub fn renewed(&self) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            ..self.clone()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            exec_timeout_ms: 60_000,
            quiescence_ms: 1_000,
            mutation_capacity: 100,
            page_url: "http://example.com".to_string(),
            referrer: None,
            memory_limit: None,
            max_stack_size: None,
            dump_script: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.exec_timeout(), Duration::from_secs(60));
        assert_eq!(config.quiescence(), Duration::from_secs(1));
        assert_eq!(config.mutation_capacity, 100);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"exec_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.exec_timeout_ms, 250);
        assert_eq!(config.page_url, "http://example.com");
        assert_ne!(config.renewed().id, config.id);
    }
}

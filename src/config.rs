//! Static engine configuration, validated once at startup and immutable
//! thereafter.

use crate::errors::ConfigError;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};

fn default_concurrency() -> usize {
    10
}

fn default_dial_retries() -> u32 {
    10
}

fn default_cleanup_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Directory where fetched blobs and merged layers are placed
    pub layers: PathBuf,
    /// Directory for per-container root filesystems
    pub containers: PathBuf,
    /// Path of the persisted journal file
    pub journal: PathBuf,

    /// Hard ceiling on concurrent container creations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Authorization header value per registry host
    #[serde(default)]
    pub registry_auth: HashMap<String, String>,
    /// Network retries for registry requests
    #[serde(default = "default_dial_retries")]
    pub dial_retries: u32,
    /// Destroy backend resources when a container is retired
    #[serde(default = "default_cleanup_enabled")]
    pub cleanup_enabled: bool,
    /// Weak cache mode: layer cache keys are unique per daemon run
    /// instead of surviving restarts
    #[serde(default)]
    pub weak_enabled: bool,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.layers.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("layers"));
        }
        if self.containers.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("containers"));
        }
        if self.journal.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("journal"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency"));
        }
        Ok(())
    }

    pub fn container_root_dir(&self, container_id: &str) -> PathBuf {
        self.containers.join(container_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_minimal_json() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"layers": "/l", "containers": "/c", "journal": "/j/journal"}"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.dial_retries, 10);
        assert!(config.cleanup_enabled);
        assert!(!config.weak_enabled);
        assert!(config.registry_auth.is_empty());
        assert_eq!(
            config.container_root_dir("abc"),
            PathBuf::from("/c/abc")
        );
    }

    #[test]
    fn empty_paths_are_rejected() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"layers": "", "containers": "/c", "journal": "/j"}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"layers": "/l", "containers": "/c", "journal": "/j", "concurrency": 0}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}

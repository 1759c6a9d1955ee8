//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use storage::{StorageConfig, StorageError};

use crate::api::RegistryBuilder;
use crate::upload::DEFAULT_CHUNK_SIZE;

/// Configuration for a registry server, usually read from TOML.
///
/// ```toml
/// bind = "0.0.0.0:9292"
/// delayed-delete = true
///
/// [storage.local]
/// path = "/var/lib/images"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RegistryConfig {
    /// Address the server listens on
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Where image content is stored
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    /// Defer backend cleanup of deleted active images to the scrubber
    #[serde(default)]
    pub delayed_delete: bool,

    /// Upper bound on the size of each chunk written to the backend
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Seconds between scrubber passes when delayed delete is enabled
    #[serde(default = "default_scrub_interval")]
    pub scrub_interval: u64,
}

fn default_bind() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, 9292).into()
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory { capacity: None }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_scrub_interval() -> u64 {
    300
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            storage: default_storage(),
            delayed_delete: false,
            chunk_size: default_chunk_size(),
            scrub_interval: default_scrub_interval(),
        }
    }
}

impl RegistryConfig {
    /// Time between scrubber passes
    pub fn scrub_interval(&self) -> Duration {
        Duration::from_secs(self.scrub_interval.max(1))
    }

    /// Construct the storage backend and a builder configured from this.
    pub async fn builder(&self) -> Result<RegistryBuilder, StorageError> {
        let storage = self.storage.clone().build().await?;
        Ok(RegistryBuilder::new()
            .storage(storage)
            .delayed_delete(self.delayed_delete)
            .chunk_size(self.chunk_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: RegistryConfig = toml_edit::de::from_str("").unwrap();
        assert_eq!(config.bind, "127.0.0.1:9292".parse().unwrap());
        assert!(matches!(
            config.storage,
            StorageConfig::Memory { capacity: None }
        ));
        assert!(!config.delayed_delete);
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.scrub_interval(), Duration::from_secs(300));
    }

    #[test]
    fn full_config() {
        let config: RegistryConfig = toml_edit::de::from_str(
            r#"
            bind = "0.0.0.0:8080"
            delayed-delete = true
            chunk-size = 4096
            scrub-interval = 60

            [storage.local]
            path = "/var/lib/images"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind.port(), 8080);
        assert!(config.delayed_delete);
        assert_eq!(config.chunk_size, 4096);
        match config.storage {
            StorageConfig::Local { path } => assert_eq!(path.as_str(), "/var/lib/images"),
            other => panic!("unexpected storage: {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml_edit::de::from_str::<RegistryConfig>("chunk_size = 1").is_err());
    }

    #[tokio::test]
    async fn memory_builder() {
        let config: RegistryConfig =
            toml_edit::de::from_str("[storage.memory]\ncapacity = 1024").unwrap();
        let registry = config.builder().await.unwrap().registry();
        assert_eq!(registry.storage().name(), "memory");
    }
}

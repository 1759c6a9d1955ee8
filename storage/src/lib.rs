//! # Storage backends
//!
//! Configuration and unification for the image byte stores.

use std::sync::Arc;

#[cfg(feature = "local")]
use camino::Utf8PathBuf;
#[cfg(feature = "local")]
use eyre::Context;
use serde::Deserialize;
use url::Url;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[doc(inline)]
pub use storage_driver::{
    ByteStream, ChunkStream, Driver, Metadata, StorageError, StorageErrorKind, Writer,
};

/// Size of the chunks drivers read stored objects back in.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Which storage backend to use, and how to set it up.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep image content in process memory
    Memory {
        /// Total bytes the backend will hold, unbounded if unset
        capacity: Option<u64>,
    },

    /// Keep image content in a directory
    #[cfg(feature = "local")]
    Local {
        /// Root directory, created if missing
        path: Utf8PathBuf,
    },
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory { capacity: None } => MemoryStorage::new().into(),
            StorageConfig::Memory {
                capacity: Some(capacity),
            } => MemoryStorage::with_capacity(capacity).into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|err| StorageError::io("local", err).path(path.as_str()).build())?;
                let root = tokio::fs::canonicalize(&path)
                    .await
                    .map_err(|err| StorageError::io("local", err).path(path.as_str()).build())?;
                let root = Utf8PathBuf::from_path_buf(root)
                    .map_err(|root| eyre::eyre!("non utf-8 storage root: {}", root.display()))
                    .context("resolving storage root")
                    .map_err(StorageError::with("local", StorageErrorKind::InvalidRequest))?;
                LocalDriver::new(root).into()
            }
        };
        tracing::debug!(driver = client.name(), "Configured storage");
        Ok(client)
    }
}

/// A cheaply cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: Arc<dyn Driver>,
}

impl<D> From<D> for Storage
where
    D: Driver + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// The Url scheme of locations in this backend.
    pub fn scheme(&self) -> &str {
        self.driver.scheme()
    }

    /// The location an image would be stored at.
    pub fn location(&self, image: &str) -> Result<Url, StorageError> {
        self.driver.location(image)
    }

    /// Open a write handle for an image. See [`Writer`].
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn writer(&self, image: &str) -> Result<Box<dyn Writer>, StorageError> {
        tracing::trace!("Opening writer for {image}");
        self.driver.writer(image).await
    }

    /// Store an image from a stream of chunks.
    #[tracing::instrument(skip(self, chunks), fields(driver=self.driver.name()))]
    pub async fn store(
        &self,
        image: &str,
        chunks: ChunkStream<'_>,
    ) -> Result<(Url, u64), StorageError> {
        self.driver.store(image, chunks).await
    }

    /// Stream the bytes stored at a location.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), %location))]
    pub async fn retrieve(&self, location: &Url) -> Result<ByteStream, StorageError> {
        tracing::trace!("Retrieving from: {location}");
        self.driver.retrieve(location).await
    }

    /// Delete the bytes stored at a location.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), %location))]
    pub async fn delete(&self, location: &Url) -> Result<(), StorageError> {
        self.driver.delete(location).await
    }

    /// Size and creation time of the object at a location.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), %location))]
    pub async fn metadata(&self, location: &Url) -> Result<Metadata, StorageError> {
        self.driver.metadata(location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_config_builds_memory_driver() {
        let config = StorageConfig::Memory { capacity: None };
        let storage = config.build().await.unwrap();
        assert_eq!(storage.name(), "memory");
        assert_eq!(storage.scheme(), "memory");
    }

    #[cfg(feature = "local")]
    #[tokio::test]
    async fn local_config_creates_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("images")).unwrap();

        let storage = StorageConfig::Local { path: root.clone() }
            .build()
            .await
            .unwrap();

        assert_eq!(storage.scheme(), "file");
        assert!(root.is_dir());
        assert!(storage.location("3").unwrap().path().ends_with("/images/3"));
    }
}

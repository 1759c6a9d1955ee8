use std::{fmt, io, ops::Deref, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use url::Url;

use crate::error::{StorageError, StorageErrorKind};

/// A lazy, finite sequence of chunks read back from a driver.
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// A lazy, finite sequence of chunks handed to a driver for storage.
///
/// The stream is consumed at most once; an `Err` item aborts the write.
pub type ChunkStream<'s> = BoxStream<'s, io::Result<Bytes>>;

/// Stored object metadata, which will be generically provided by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the stored object in bytes.
    pub size: u64,

    /// The creation timestamp of the stored object.
    pub created: DateTime<Utc>,
}

/// An open write handle for a single image.
///
/// Bytes written through the handle are not visible at [`Writer::location`]
/// until [`Writer::commit`] succeeds. A handle that is aborted, or dropped
/// without being committed, leaves nothing behind at its location.
#[async_trait::async_trait]
pub trait Writer: fmt::Debug + Send {
    /// The location this handle will publish to on commit.
    fn location(&self) -> &Url;

    /// Append a chunk to the pending object.
    async fn write(&mut self, chunk: Bytes) -> Result<(), StorageError>;

    /// Publish the pending object at its location, returning the number of
    /// bytes written.
    async fn commit(self: Box<Self>) -> Result<u64, StorageError>;

    /// Discard the pending object.
    async fn abort(self: Box<Self>) -> Result<(), StorageError>;
}

/// A storage driver, which provides the ability to interact with a storage backend.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// The Url scheme of locations produced by this driver.
    fn scheme(&self) -> &str;

    /// The location an image's bytes are addressed by in this driver.
    fn location(&self, image: &str) -> Result<Url, StorageError>;

    /// Open a write handle for an image.
    async fn writer(&self, image: &str) -> Result<Box<dyn Writer>, StorageError>;

    /// Stream the bytes stored at a location.
    async fn retrieve(&self, location: &Url) -> Result<ByteStream, StorageError>;

    /// Delete the bytes stored at a location.
    ///
    /// A location that does not exist yields a [`StorageErrorKind::NotFound`]
    /// error; callers decide whether that matters.
    async fn delete(&self, location: &Url) -> Result<(), StorageError>;

    /// Get the metadata for a stored object.
    async fn metadata(&self, location: &Url) -> Result<Metadata, StorageError>;

    /// Store an image from a stream of chunks, returning the location and the
    /// number of bytes written.
    ///
    /// If the stream yields an error, or a write fails, the partial object is
    /// discarded and the error is returned.
    async fn store(&self, image: &str, mut chunks: ChunkStream<'_>) -> Result<(Url, u64), StorageError> {
        let mut writer = self.writer(image).await?;

        while let Some(chunk) = chunks.next().await {
            let result = match chunk {
                Ok(chunk) => writer.write(chunk).await,
                Err(error) => Err(StorageError::builder(self.name(), StorageErrorKind::Io, error)
                    .path(image)
                    .context("read source stream")
                    .build()),
            };

            if let Err(error) = result {
                if let Err(abort) = writer.abort().await {
                    tracing::warn!(%abort, "Failed to discard partial write for {image}");
                }
                return Err(error);
            }
        }

        let location = writer.location().clone();
        let written = writer.commit().await?;
        tracing::trace!(%location, written, "Stored {image}");
        Ok((location, written))
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    fn scheme(&self) -> &str {
        self.deref().scheme()
    }

    fn location(&self, image: &str) -> Result<Url, StorageError> {
        self.deref().location(image)
    }

    async fn writer(&self, image: &str) -> Result<Box<dyn Writer>, StorageError> {
        self.deref().writer(image).await
    }

    async fn retrieve(&self, location: &Url) -> Result<ByteStream, StorageError> {
        self.deref().retrieve(location).await
    }

    async fn delete(&self, location: &Url) -> Result<(), StorageError> {
        self.deref().delete(location).await
    }

    async fn metadata(&self, location: &Url) -> Result<Metadata, StorageError> {
        self.deref().metadata(location).await
    }

    async fn store(&self, image: &str, chunks: ChunkStream<'_>) -> Result<(Url, u64), StorageError> {
        self.deref().store(image, chunks).await
    }
}

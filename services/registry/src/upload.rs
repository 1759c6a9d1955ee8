//! Streaming upload pipeline
//!
//! Moves an image's content from an inbound byte stream into the storage
//! backend, folding every chunk into a [`Checksum`] on the way. Memory use is
//! bounded by the chunk size regardless of the size of the image.

use std::error::Error as StdError;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use storage::{Storage, Writer};
use url::Url;

use crate::checksum::{self, Checksum};
use crate::error::{RegistryError, RegistryResult};
use crate::image::{Image, ImageStatus};

/// Default upper bound on the size of a chunk written to the backend.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Writes image content to a storage backend while verifying its checksum.
#[derive(Debug, Clone)]
pub struct Uploader {
    storage: Storage,
    chunk_size: usize,
}

impl Uploader {
    /// Create an uploader writing to `storage`.
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Bound the size of each chunk written to the backend.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// The backend this uploader writes to.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Ingest `body` as the content of `image`.
    ///
    /// The image must be `queued` or `saving`. On return the record reflects
    /// the outcome and should be persisted whether or not this succeeded:
    ///
    /// - success: `active`, with `checksum`, `size` and `location` set.
    /// - checksum mismatch: `killed`, with `location` naming the discarded
    ///   write, and [`RegistryError::ChecksumMismatch`] returned.
    /// - stream or backend failure: `killed`, and
    ///   [`RegistryError::UploadFailed`] returned. `location` is only left
    ///   set if the partial write could not be cleaned up.
    ///
    /// The inbound stream and the backend write handle are released before
    /// the record is marked `killed`.
    #[tracing::instrument(skip_all, fields(id = %image.id, driver = self.storage.name()))]
    pub async fn ingest<S, E>(
        &self,
        image: &mut Image,
        body: S,
        expected_checksum: Option<&str>,
    ) -> RegistryResult<()>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        image.transition(ImageStatus::Saving)?;
        image.checksum = None;
        let id = image.id;

        let mut writer = match self.storage.writer(&id.to_string()).await {
            Ok(writer) => writer,
            Err(error) => {
                kill(image, None)?;
                return Err(RegistryError::upload_failed(id, error));
            }
        };

        let mut body = Box::pin(body);
        let mut checksum = Checksum::new();

        let received: RegistryResult<()> = 'read: loop {
            let mut chunk = match body.next().await {
                None => break Ok(()),
                Some(Ok(chunk)) => chunk,
                Some(Err(error)) => break Err(RegistryError::upload_failed(id, error)),
            };

            while !chunk.is_empty() {
                let piece = chunk.split_to(chunk.len().min(self.chunk_size));
                checksum.update(&piece);
                if let Err(error) = writer.write(piece).await {
                    break 'read Err(RegistryError::upload_failed(id, error));
                }
            }
        };
        drop(body);

        if let Err(error) = received {
            let stale = discard(writer).await;
            kill(image, stale)?;
            tracing::warn!(%error, "Upload failed, image killed");
            return Err(error);
        }

        let (actual, size) = checksum.finalize();

        if let Some(expected) = expected_checksum {
            if !checksum::matches(expected, &actual) {
                let location = writer.location().clone();
                discard(writer).await;
                kill(image, Some(location))?;
                tracing::warn!(%expected, %actual, "Checksum mismatch, image killed");
                return Err(RegistryError::ChecksumMismatch {
                    expected: expected.to_owned(),
                    actual,
                });
            }
        }

        let location = writer.location().clone();
        let written = match writer.commit().await {
            Ok(written) => written,
            Err(error) => {
                kill(image, None)?;
                tracing::warn!(%error, "Commit failed, image killed");
                return Err(RegistryError::upload_failed(id, error));
            }
        };
        tracing::trace!(size, written, "Committed upload");

        image.checksum = Some(actual);
        image.size = size;
        image.location = Some(location);
        image.transition(ImageStatus::Active)?;

        tracing::info!(size, checksum = image.checksum.as_deref(), "Image active");
        Ok(())
    }
}

/// Discard a partial write, returning its location if that failed and the
/// location may hold stale data.
async fn discard(writer: Box<dyn Writer>) -> Option<Url> {
    let location = writer.location().clone();
    match writer.abort().await {
        Ok(()) => None,
        Err(error) => {
            tracing::warn!(%location, %error, "Failed to clean up partial upload");
            Some(location)
        }
    }
}

fn kill(image: &mut Image, location: Option<Url>) -> RegistryResult<()> {
    image.checksum = None;
    image.location = location;
    image.transition(ImageStatus::Killed)
}

//! The registry facade
//!
//! [`Registry`] is the only writer of an image's `status`, `checksum`, `size`
//! and `location`. Each operation reads the current record from the metadata
//! store, works on a local copy and writes it back.

use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use storage::{ByteStream, Storage};

use crate::error::{RegistryError, RegistryResult};
use crate::format::{self, ContainerFormat, DiskFormat};
use crate::image::{Image, ImageId, ImageStatus, ImageSummary, ImageUpdate, NewImage};
use crate::metadata::{ImageFilter, MetadataStore};
use crate::upload::Uploader;

/// Coordinates the metadata store, the storage backend and the upload
/// pipeline.
#[derive(Debug, Clone)]
pub struct Registry {
    metadata: Arc<dyn MetadataStore>,
    uploader: Uploader,
    delayed_delete: bool,
}

impl Registry {
    /// Create a registry over a metadata store and a storage backend.
    pub fn new(metadata: Arc<dyn MetadataStore>, storage: Storage) -> Self {
        Self {
            metadata,
            uploader: Uploader::new(storage),
            delayed_delete: false,
        }
    }

    /// Bound the size of each chunk written to the backend.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.uploader = self.uploader.with_chunk_size(chunk_size);
        self
    }

    /// Defer backend cleanup of deleted active images to [`Registry::scrub`].
    pub fn with_delayed_delete(mut self, delayed_delete: bool) -> Self {
        self.delayed_delete = delayed_delete;
        self
    }

    /// The storage backend holding image content.
    pub fn storage(&self) -> &Storage {
        self.uploader.storage()
    }

    /// Summaries of the images matching `filter`.
    pub async fn list_summaries(&self, filter: &ImageFilter) -> RegistryResult<Vec<ImageSummary>> {
        let images = self.metadata.list(filter).await?;
        Ok(images.iter().map(Image::summary).collect())
    }

    /// Full records of the images matching `filter`.
    pub async fn list_details(&self, filter: &ImageFilter) -> RegistryResult<Vec<Image>> {
        Ok(self.metadata.list(filter).await?)
    }

    /// A single live image.
    pub async fn get(&self, id: ImageId) -> RegistryResult<Image> {
        Ok(self.metadata.get(id).await?)
    }

    /// Register an image without content. It is created `queued`.
    #[tracing::instrument(skip_all)]
    pub async fn create(&self, new: NewImage) -> RegistryResult<Image> {
        self.register(new, false).await
    }

    /// Register an image and ingest its content.
    ///
    /// The record is persisted as `saving` before any bytes are read. If
    /// ingestion fails the `killed` record is kept and the ingestion error is
    /// returned.
    #[tracing::instrument(skip_all)]
    pub async fn create_with_content<S, E>(&self, new: NewImage, body: S) -> RegistryResult<Image>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let expected = new.checksum.clone();
        let mut image = self.register(new, true).await?;

        let outcome = self
            .uploader
            .ingest(&mut image, body, expected.as_deref())
            .await;
        self.settle(&image, outcome).await?;
        Ok(image)
    }

    async fn register(&self, new: NewImage, has_content: bool) -> RegistryResult<Image> {
        let (disk_format, container_format) =
            format::validate(new.disk_format.as_deref(), new.container_format.as_deref())?;

        let status = ImageStatus::initial(has_content);
        if let Some(requested) = new.status.as_deref() {
            let requested: ImageStatus = requested.parse()?;
            if requested != status {
                return Err(RegistryError::InvalidStatusTransition {
                    from: status,
                    to: requested,
                });
            }
        }

        let now = Utc::now();
        let mut image = Image {
            id: ImageId::new(0),
            name: new.name,
            is_public: new.is_public,
            disk_format,
            container_format,
            size: 0,
            checksum: None,
            status,
            location: None,
            properties: new.properties,
            owner: new.owner,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted: false,
        };

        image.id = self.metadata.create(&image).await?;
        tracing::info!(id = %image.id, %status, "Image created");
        Ok(image)
    }

    /// Ingest content for an image registered without it.
    ///
    /// Only a `queued` image, or a `saving` one with nothing stored yet,
    /// accepts content.
    #[tracing::instrument(skip_all, fields(%id))]
    pub async fn upload<S, E>(
        &self,
        id: ImageId,
        body: S,
        expected_checksum: Option<&str>,
    ) -> RegistryResult<Image>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let mut image = self.metadata.get(id).await?;
        accepts_content(&image)?;
        self.begin_saving(&mut image).await?;

        let outcome = self
            .uploader
            .ingest(&mut image, body, expected_checksum)
            .await;
        self.settle(&image, outcome).await?;
        Ok(image)
    }

    /// Apply a partial change to an image.
    ///
    /// Every change is validated against the current record before anything
    /// is written. Status cannot be changed here: content goes through
    /// [`Registry::upload`] and deletion through [`Registry::delete`].
    #[tracing::instrument(skip_all, fields(%id))]
    pub async fn update(&self, id: ImageId, changes: ImageUpdate) -> RegistryResult<Image> {
        let mut image = self.metadata.get(id).await?;
        if changes.is_empty() {
            return Ok(image);
        }

        apply(&mut image, changes)?;
        self.metadata.update(id, &image).await?;
        tracing::debug!("Image updated");
        Ok(image)
    }

    /// Apply a partial change to an image and ingest its content.
    ///
    /// The changes are validated, and the image must be able to accept
    /// content once they are applied, before anything is written.
    #[tracing::instrument(skip_all, fields(%id))]
    pub async fn update_with_content<S, E>(
        &self,
        id: ImageId,
        changes: ImageUpdate,
        body: S,
    ) -> RegistryResult<Image>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let mut image = self.metadata.get(id).await?;
        let expected = changes.checksum.clone();
        apply(&mut image, changes)?;
        accepts_content(&image)?;
        self.begin_saving(&mut image).await?;

        let outcome = self
            .uploader
            .ingest(&mut image, body, expected.as_deref())
            .await;
        self.settle(&image, outcome).await?;
        Ok(image)
    }

    /// Delete an image.
    ///
    /// Stored content is removed from the backend before the record is marked
    /// `deleted`; content that is already gone counts as removed. With delayed
    /// delete enabled an `active` image only moves to `pending_delete`.
    #[tracing::instrument(skip_all, fields(%id))]
    pub async fn delete(&self, id: ImageId) -> RegistryResult<Image> {
        let mut image = self.metadata.get(id).await?;

        if self.delayed_delete && image.status == ImageStatus::Active {
            image.transition(ImageStatus::PendingDelete)?;
            self.metadata.update(id, &image).await?;
            tracing::info!("Image pending delete");
            return Ok(image);
        }

        self.finalize_delete(&mut image).await?;
        tracing::info!("Image deleted");
        Ok(image)
    }

    /// Finish deleting every `pending_delete` image, returning their ids.
    ///
    /// Images whose content could not be removed are left pending for the
    /// next pass.
    #[tracing::instrument(skip(self))]
    pub async fn scrub(&self) -> RegistryResult<Vec<ImageId>> {
        let pending = ImageFilter {
            status: Some(ImageStatus::PendingDelete),
            ..Default::default()
        };

        let mut scrubbed = Vec::new();
        for mut image in self.metadata.list(&pending).await? {
            let id = image.id;
            match self.finalize_delete(&mut image).await {
                Ok(()) => scrubbed.push(id),
                Err(error) => tracing::warn!(%id, %error, "Failed to scrub image"),
            }
        }

        tracing::debug!(count = scrubbed.len(), "Scrubbed pending deletes");
        Ok(scrubbed)
    }

    async fn finalize_delete(&self, image: &mut Image) -> RegistryResult<()> {
        image.status.transition(ImageStatus::Deleted)?;

        if let Some(location) = &image.location {
            match self.storage().delete(location).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {
                    tracing::debug!(%location, "Image content already absent");
                }
                Err(error) => return Err(error.into()),
            }
        }

        image.transition(ImageStatus::Deleted)?;
        self.metadata.update(image.id, image).await?;
        self.metadata.soft_delete(image.id).await?;

        let now = Utc::now();
        image.deleted = true;
        image.deleted_at = Some(now);
        image.updated_at = now;
        Ok(())
    }

    /// The record and content of an `active` image.
    #[tracing::instrument(skip_all, fields(%id))]
    pub async fn retrieve(&self, id: ImageId) -> RegistryResult<(Image, ByteStream)> {
        let image = self.metadata.get(id).await?;
        let Some(location) = image.location.as_ref().filter(|_| image.has_content()) else {
            return Err(RegistryError::NotFound(id));
        };

        let content = match self.storage().retrieve(location).await {
            Ok(content) => content,
            Err(error) if error.is_not_found() => {
                tracing::warn!(%location, "Content of active image is missing");
                return Err(RegistryError::NotFound(id));
            }
            Err(error) => return Err(error.into()),
        };
        Ok((image, content))
    }

    /// Mark an image `saving` in the store before any of its bytes are read.
    async fn begin_saving(&self, image: &mut Image) -> RegistryResult<()> {
        image.transition(ImageStatus::Saving)?;
        self.metadata.update(image.id, image).await?;
        Ok(())
    }

    /// Persist the record produced by an ingest, whatever its outcome.
    ///
    /// Content committed for a record that can no longer be written is
    /// removed again.
    async fn settle(&self, image: &Image, outcome: RegistryResult<()>) -> RegistryResult<()> {
        let persisted = self.metadata.update(image.id, image).await;
        match (outcome, persisted) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(persist)) => {
                if let Some(location) = &image.location {
                    match self.storage().delete(location).await {
                        Ok(()) => tracing::debug!(%location, "Removed content of unrecorded upload"),
                        Err(error) => {
                            tracing::warn!(%location, %error, "Failed to remove content of unrecorded upload")
                        }
                    }
                }
                Err(persist.into())
            }
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(persist)) => {
                tracing::warn!(id = %image.id, %persist, "Failed to record failed upload");
                Err(error)
            }
        }
    }
}

fn accepts_content(image: &Image) -> RegistryResult<()> {
    match (image.status, &image.location) {
        (ImageStatus::Queued, _) | (ImageStatus::Saving, None) => Ok(()),
        (status, _) => Err(RegistryError::Conflict(format!(
            "image {} is {status} and cannot accept content",
            image.id
        ))),
    }
}

/// Validate `changes` against `image` and apply them. Nothing is modified if
/// any change is rejected.
fn apply(image: &mut Image, changes: ImageUpdate) -> RegistryResult<()> {
    let (disk, container) = format::validate(
        changes.disk_format.as_deref(),
        changes.container_format.as_deref(),
    )?;
    let disk_format: Option<DiskFormat> = disk.or(image.disk_format);
    let container_format: Option<ContainerFormat> = container.or(image.container_format);
    format::check_compatible(disk_format, container_format)?;

    let status = match changes.status.as_deref() {
        None => image.status,
        Some(requested) => {
            // Status is driven by ingestion and deletion; an update may only
            // restate the current one.
            let requested: ImageStatus = requested.parse()?;
            if requested != image.status {
                return Err(RegistryError::InvalidStatusTransition {
                    from: image.status,
                    to: requested,
                });
            }
            requested
        }
    };

    if changes.purge_properties {
        image.properties = changes.properties;
    } else {
        image.properties.extend(changes.properties);
    }
    if let Some(name) = changes.name {
        image.name = Some(name);
    }
    if let Some(is_public) = changes.is_public {
        image.is_public = is_public;
    }
    if let Some(owner) = changes.owner {
        image.owner = Some(owner);
    }
    image.disk_format = disk_format;
    image.container_format = container_format;
    image.status = status;
    image.touch();
    Ok(())
}

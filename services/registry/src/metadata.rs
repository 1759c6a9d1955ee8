//! Metadata store contract and an in-memory implementation

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::format::{ContainerFormat, DiskFormat};
use crate::image::{Image, ImageId, ImageStatus};

/// Errors from a metadata store.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// No live record with this id
    #[error("image {0} not found")]
    NotFound(ImageId),

    /// The store itself failed
    #[error("metadata store failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Criteria for listing images. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ImageFilter {
    /// Exact name
    pub name: Option<String>,
    /// Exact status
    pub status: Option<ImageStatus>,
    /// Exact disk format
    pub disk_format: Option<DiskFormat>,
    /// Exact container format
    pub container_format: Option<ContainerFormat>,
    /// Visibility
    pub is_public: Option<bool>,
    /// Minimum size in bytes, inclusive
    pub size_min: Option<u64>,
    /// Maximum size in bytes, inclusive
    pub size_max: Option<u64>,
    /// Properties which must be present with these values
    #[serde(skip)]
    pub properties: HashMap<String, String>,
    /// Include soft-deleted records
    pub include_deleted: bool,
}

impl ImageFilter {
    /// Whether an image satisfies this filter.
    pub fn matches(&self, image: &Image) -> bool {
        (self.include_deleted || !image.deleted)
            && self.name.as_ref().is_none_or(|n| image.name.as_ref() == Some(n))
            && self.status.is_none_or(|s| image.status == s)
            && self
                .disk_format
                .is_none_or(|f| image.disk_format == Some(f))
            && self
                .container_format
                .is_none_or(|f| image.container_format == Some(f))
            && self.is_public.is_none_or(|p| image.is_public == p)
            && self.size_min.is_none_or(|min| image.size >= min)
            && self.size_max.is_none_or(|max| image.size <= max)
            && self
                .properties
                .iter()
                .all(|(k, v)| image.properties.get(k) == Some(v))
    }
}

/// Narrow CRUD interface to wherever image records are persisted.
///
/// Soft-deleted records are invisible to `get`, `update` and `soft_delete`,
/// and only appear in `list` when the filter asks for them.
#[async_trait::async_trait]
pub trait MetadataStore: fmt::Debug + Send + Sync {
    /// Fetch a live record.
    async fn get(&self, id: ImageId) -> Result<Image, MetadataError>;

    /// List records matching a filter, ordered by id.
    async fn list(&self, filter: &ImageFilter) -> Result<Vec<Image>, MetadataError>;

    /// Persist a new record, returning the id the store assigned.
    ///
    /// The `id` field of the record passed in is ignored.
    async fn create(&self, image: &Image) -> Result<ImageId, MetadataError>;

    /// Replace a live record.
    async fn update(&self, id: ImageId, image: &Image) -> Result<(), MetadataError>;

    /// Mark a live record as deleted.
    async fn soft_delete(&self, id: ImageId) -> Result<(), MetadataError>;
}

#[derive(Debug, Default)]
struct Records {
    next: u64,
    images: BTreeMap<ImageId, Image>,
}

/// Metadata store that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: RwLock<Records>,
}

impl MemoryMetadataStore {
    /// Create an empty store. Ids are assigned from 1.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, id: ImageId) -> Result<Image, MetadataError> {
        let records = self.records.read().await;
        records
            .images
            .get(&id)
            .filter(|image| !image.deleted)
            .cloned()
            .ok_or(MetadataError::NotFound(id))
    }

    async fn list(&self, filter: &ImageFilter) -> Result<Vec<Image>, MetadataError> {
        let records = self.records.read().await;
        Ok(records
            .images
            .values()
            .filter(|image| filter.matches(image))
            .cloned()
            .collect())
    }

    async fn create(&self, image: &Image) -> Result<ImageId, MetadataError> {
        let mut records = self.records.write().await;
        records.next += 1;
        let id = ImageId::new(records.next);

        let mut image = image.clone();
        image.id = id;
        records.images.insert(id, image);

        tracing::trace!(%id, "Created image record");
        Ok(id)
    }

    async fn update(&self, id: ImageId, image: &Image) -> Result<(), MetadataError> {
        let mut records = self.records.write().await;
        let record = records
            .images
            .get_mut(&id)
            .filter(|image| !image.deleted)
            .ok_or(MetadataError::NotFound(id))?;

        *record = Image {
            id,
            ..image.clone()
        };
        Ok(())
    }

    async fn soft_delete(&self, id: ImageId) -> Result<(), MetadataError> {
        let mut records = self.records.write().await;
        let record = records
            .images
            .get_mut(&id)
            .filter(|image| !image.deleted)
            .ok_or(MetadataError::NotFound(id))?;

        let now = Utc::now();
        record.deleted = true;
        record.deleted_at = Some(now);
        record.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str) -> Image {
        let now = Utc::now();
        Image {
            id: ImageId::new(0),
            name: Some(name.to_owned()),
            is_public: true,
            disk_format: Some(DiskFormat::Vhd),
            container_format: Some(ContainerFormat::Ovf),
            size: 0,
            checksum: None,
            status: ImageStatus::Queued,
            location: None,
            properties: Default::default(),
            owner: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn ids_are_assigned_sequentially() {
        let store = MemoryMetadataStore::new();
        let first = store.create(&image("one")).await.unwrap();
        let second = store.create(&image("two")).await.unwrap();
        assert_eq!(first, ImageId::new(1));
        assert_eq!(second, ImageId::new(2));
        assert_eq!(store.get(second).await.unwrap().id, second);
    }

    #[tokio::test]
    async fn soft_deleted_records_are_hidden() {
        let store = MemoryMetadataStore::new();
        let id = store.create(&image("one")).await.unwrap();

        store.soft_delete(id).await.unwrap();

        assert!(matches!(store.get(id).await, Err(MetadataError::NotFound(_))));
        assert!(matches!(
            store.soft_delete(id).await,
            Err(MetadataError::NotFound(_))
        ));
        assert!(matches!(
            store.update(id, &image("again")).await,
            Err(MetadataError::NotFound(_))
        ));
        assert!(store.list(&ImageFilter::default()).await.unwrap().is_empty());

        let all = ImageFilter {
            include_deleted: true,
            ..Default::default()
        };
        let listed = store.list(&all).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].deleted_at.is_some());
    }

    #[tokio::test]
    async fn filters_match_every_set_field() {
        let store = MemoryMetadataStore::new();

        let mut private = image("private");
        private.is_public = false;
        private.size = 100;
        private.properties.insert("arch".into(), "x86_64".into());
        store.create(&private).await.unwrap();

        let mut raw = image("raw");
        raw.disk_format = Some(DiskFormat::Raw);
        raw.container_format = Some(ContainerFormat::Bare);
        raw.size = 10;
        store.create(&raw).await.unwrap();

        let public = ImageFilter {
            is_public: Some(true),
            ..Default::default()
        };
        let names: Vec<_> = store
            .list(&public)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name.unwrap())
            .collect();
        assert_eq!(names, ["raw"]);

        let large = ImageFilter {
            size_min: Some(50),
            ..Default::default()
        };
        assert_eq!(store.list(&large).await.unwrap().len(), 1);

        let mut arch = ImageFilter::default();
        arch.properties.insert("arch".into(), "x86_64".into());
        let found = store.list(&arch).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.as_deref(), Some("private"));

        let bare = ImageFilter {
            container_format: Some(ContainerFormat::Bare),
            ..Default::default()
        };
        assert_eq!(store.list(&bare).await.unwrap().len(), 1);
    }
}

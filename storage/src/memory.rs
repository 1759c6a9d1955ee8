use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::RwLock;
use url::Url;

use storage_driver::{ByteStream, Driver, Metadata, StorageError, StorageErrorKind, Writer};

use crate::READ_CHUNK_SIZE;

const NAME: &str = "memory";

type Objects = Arc<RwLock<HashMap<Url, MemoryObject>>>;

fn not_found(location: &Url) -> StorageError {
    StorageError::builder(
        NAME,
        StorageErrorKind::NotFound,
        io::Error::new(io::ErrorKind::NotFound, format!("Path not found: {location}")),
    )
    .path(location.as_str())
    .build()
}

#[derive(Debug)]
struct MemoryObject {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Bytes> for MemoryObject {
    fn from(data: Bytes) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryObject> for Metadata {
    fn from(value: &MemoryObject) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that stores images in memory.
///
/// Clones share the same objects, so a test can keep a handle to inspect what
/// a registry wrote.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    objects: Objects,
    capacity: Option<u64>,
}

impl MemoryStorage {
    /// Create a new, empty `MemoryStorage`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `MemoryStorage` which refuses writes once `capacity` bytes
    /// (committed and pending) would be exceeded.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            objects: Objects::default(),
            capacity: Some(capacity),
        }
    }

    /// Number of objects currently stored.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether no objects are stored.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[derive(Debug)]
struct MemoryWriter {
    location: Url,
    buffer: BytesMut,
    objects: Objects,
    capacity: Option<u64>,
}

#[async_trait::async_trait]
impl Writer for MemoryWriter {
    fn location(&self) -> &Url {
        &self.location
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), StorageError> {
        if let Some(capacity) = self.capacity {
            let stored: u64 = self
                .objects
                .read()
                .await
                .values()
                .map(|object| object.data.len() as u64)
                .sum();
            let pending = (self.buffer.len() + chunk.len()) as u64;
            if stored + pending > capacity {
                return Err(StorageError::builder(
                    NAME,
                    StorageErrorKind::Io,
                    io::Error::other("memory capacity exceeded"),
                )
                .path(self.location.as_str())
                .build());
            }
        }

        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64, StorageError> {
        let MemoryWriter {
            location,
            buffer,
            objects,
            ..
        } = *self;
        let size = buffer.len() as u64;
        objects
            .write()
            .await
            .insert(location, buffer.freeze().into());
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        NAME
    }

    fn scheme(&self) -> &str {
        "memory"
    }

    fn location(&self, image: &str) -> Result<Url, StorageError> {
        let mut location = Url::parse("memory://images/")
            .map_err(StorageError::with(NAME, StorageErrorKind::Other))?;
        location
            .path_segments_mut()
            .map_err(|_| {
                StorageError::new(
                    NAME,
                    StorageErrorKind::Other,
                    "memory locations have path segments",
                )
            })?
            .pop_if_empty()
            .push(image);
        Ok(location)
    }

    async fn writer(&self, image: &str) -> Result<Box<dyn Writer>, StorageError> {
        Ok(Box::new(MemoryWriter {
            location: self.location(image)?,
            buffer: BytesMut::new(),
            objects: self.objects.clone(),
            capacity: self.capacity,
        }))
    }

    async fn retrieve(&self, location: &Url) -> Result<ByteStream, StorageError> {
        let mut data = self
            .objects
            .read()
            .await
            .get(location)
            .ok_or_else(|| not_found(location))?
            .data
            .clone();

        let mut chunks = Vec::with_capacity(data.len() / READ_CHUNK_SIZE + 1);
        while !data.is_empty() {
            let at = data.len().min(READ_CHUNK_SIZE);
            chunks.push(Ok(data.split_to(at)));
        }

        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn delete(&self, location: &Url) -> Result<(), StorageError> {
        self.objects
            .write()
            .await
            .remove(location)
            .map(|_| ())
            .ok_or_else(|| not_found(location))
    }

    async fn metadata(&self, location: &Url) -> Result<Metadata, StorageError> {
        self.objects
            .read()
            .await
            .get(location)
            .map(Metadata::from)
            .ok_or_else(|| not_found(location))
    }
}

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use eyre::{eyre, WrapErr};
use futures::StreamExt;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

use storage_driver::{ByteStream, Driver, Metadata, StorageError, StorageErrorKind, Writer};

use crate::READ_CHUNK_SIZE;

const NAME: &str = "local";

/// Filesystem driver, addressing each image by its identifier directly under
/// a root directory.
///
/// Writes are staged in a temporary file inside the root and renamed into
/// place on commit, so a location is either fully written or absent.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`, which should be an absolute path.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// The directory images are stored in.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn target(&self, image: &str) -> Result<Utf8PathBuf, StorageError> {
        if image.is_empty() || image == "." || image == ".." || image.contains(['/', '\\']) {
            return Err(StorageError::builder(
                NAME,
                StorageErrorKind::InvalidRequest,
                eyre!("image identifier is not a single path segment"),
            )
            .path(image)
            .build());
        }
        Ok(self.root.join(image))
    }

    fn path(&self, location: &Url) -> Result<Utf8PathBuf, StorageError> {
        let invalid = |reason: &'static str| {
            StorageError::builder(NAME, StorageErrorKind::InvalidRequest, eyre!(reason))
                .path(location.as_str())
                .build()
        };

        if location.scheme() != "file" {
            return Err(invalid("not a file:// location"));
        }

        let path = location
            .to_file_path()
            .map_err(|_| invalid("location has no file path"))?;
        let path = Utf8PathBuf::from_path_buf(path).map_err(|_| invalid("non utf-8 path"))?;

        if path.parent() != Some(self.root.as_path()) {
            return Err(invalid("location is outside the storage root"));
        }

        Ok(path)
    }
}

#[derive(Debug)]
struct LocalWriter {
    location: Url,
    target: Utf8PathBuf,
    file: tokio::io::BufWriter<tokio::fs::File>,
    staging: TempPath,
    written: u64,
}

#[async_trait::async_trait]
impl Writer for LocalWriter {
    fn location(&self) -> &Url {
        &self.location
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), StorageError> {
        self.file.write_all(&chunk).await.map_err(|err| {
            StorageError::io(NAME, err)
                .path(self.location.as_str())
                .context("write staging file")
                .build()
        })?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64, StorageError> {
        let LocalWriter {
            location,
            target,
            mut file,
            staging,
            written,
        } = *self;

        let failed = |context: &'static str| {
            let location = location.to_string();
            move |err| StorageError::io(NAME, err).path(location).context(context).build()
        };

        file.shutdown().await.map_err(failed("flush staging file"))?;
        file.get_ref()
            .sync_all()
            .await
            .map_err(failed("sync staging file"))?;
        drop(file);

        // A failed rename drops the staging path, which removes it.
        staging
            .persist(&target)
            .map_err(|err| err.error)
            .map_err(failed("publish staging file"))?;

        tracing::trace!(%location, written, "Committed {target}");
        Ok(written)
    }

    async fn abort(self: Box<Self>) -> Result<(), StorageError> {
        let LocalWriter {
            location,
            file,
            staging,
            ..
        } = *self;
        drop(file);
        staging.close().map_err(|err| {
            StorageError::io(NAME, err)
                .path(location.as_str())
                .context("remove staging file")
                .build()
        })
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn scheme(&self) -> &str {
        "file"
    }

    fn location(&self, image: &str) -> Result<Url, StorageError> {
        let target = self.target(image)?;
        Url::from_file_path(&target).map_err(|_| {
            StorageError::builder(
                NAME,
                StorageErrorKind::InvalidRequest,
                eyre!("storage root is not an absolute path"),
            )
            .path(target.as_str())
            .build()
        })
    }

    async fn writer(&self, image: &str) -> Result<Box<dyn Writer>, StorageError> {
        let location = self.location(image)?;
        let target = self.target(image)?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| StorageError::io(NAME, err).path(self.root.as_str()).build())?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempfile_in(&self.root)
            .wrap_err("create staging file")
            .map_err(StorageError::with(NAME, StorageErrorKind::Io))?;
        let (file, staging) = staging.into_parts();

        Ok(Box::new(LocalWriter {
            location,
            target,
            file: tokio::io::BufWriter::new(tokio::fs::File::from_std(file)),
            staging,
            written: 0,
        }))
    }

    async fn retrieve(&self, location: &Url) -> Result<ByteStream, StorageError> {
        let path = self.path(location)?;
        let file = tokio::fs::File::open(&path).await.map_err(|err| {
            StorageError::io(NAME, err)
                .path(location.as_str())
                .context("open")
                .build()
        })?;

        let location = location.to_string();
        Ok(ReaderStream::with_capacity(file, READ_CHUNK_SIZE)
            .map(move |chunk| {
                chunk.map_err(|err| {
                    StorageError::io(NAME, err)
                        .path(location.clone())
                        .context("read")
                        .build()
                })
            })
            .boxed())
    }

    async fn delete(&self, location: &Url) -> Result<(), StorageError> {
        let path = self.path(location)?;
        tokio::fs::remove_file(&path).await.map_err(|err| {
            StorageError::io(NAME, err)
                .path(location.as_str())
                .context("remove")
                .build()
        })?;
        Ok(())
    }

    async fn metadata(&self, location: &Url) -> Result<Metadata, StorageError> {
        let path = self.path(location)?;
        let failed = |err| {
            StorageError::io(NAME, err)
                .path(location.as_str())
                .context("metadata")
                .build()
        };

        let metadata = tokio::fs::metadata(&path).await.map_err(failed)?;
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(failed)?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use tempfile::TempDir;

    use super::*;

    fn driver() -> (TempDir, LocalDriver) {
        let dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();
        (dir, LocalDriver::new(root))
    }

    fn chunks(parts: &[&'static [u8]]) -> storage_driver::ChunkStream<'static> {
        futures::stream::iter(parts.iter().map(|p| Ok(Bytes::from_static(p))).collect::<Vec<_>>())
            .boxed()
    }

    #[tokio::test]
    async fn store_and_retrieve() {
        let (_dir, driver) = driver();

        let (location, written) = driver
            .store("3", chunks(&[b"chunk00000", b"remainder"]))
            .await
            .unwrap();

        assert_eq!(written, 19);
        assert_eq!(location.scheme(), "file");
        assert_eq!(
            location.to_file_path().unwrap(),
            driver.root().join("3").into_std_path_buf()
        );

        let data: Vec<Bytes> = driver.retrieve(&location).await.unwrap().try_collect().await.unwrap();
        assert_eq!(data.concat(), b"chunk00000remainder");
        assert_eq!(driver.metadata(&location).await.unwrap().size, 19);
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let (_dir, driver) = driver();

        let mut writer = driver.writer("5").await.unwrap();
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        let location = writer.location().clone();

        let error = driver.metadata(&location).await.unwrap_err();
        assert!(error.is_not_found());

        writer.abort().await.unwrap();
        assert!(driver.metadata(&location).await.unwrap_err().is_not_found());

        let leftovers = std::fs::read_dir(driver.root()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn dropped_writer_leaves_nothing() {
        let (_dir, driver) = driver();

        let mut writer = driver.writer("6").await.unwrap();
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        drop(writer);

        let leftovers = std::fs::read_dir(driver.root()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn delete_missing_location_is_not_found() {
        let (_dir, driver) = driver();

        let (location, _) = driver.store("7", chunks(&[b"bytes"])).await.unwrap();
        driver.delete(&location).await.unwrap();

        let error = driver.delete(&location).await.unwrap_err();
        assert_eq!(error.kind(), StorageErrorKind::NotFound);
    }

    #[tokio::test]
    async fn rejects_foreign_locations() {
        let (_dir, driver) = driver();

        let outside = Url::parse("file:///etc/passwd").unwrap();
        let error = driver.retrieve(&outside).await.err().expect("expected an error");
        assert_eq!(error.kind(), StorageErrorKind::InvalidRequest);

        let memory = Url::parse("memory://images/3").unwrap();
        let error = driver.delete(&memory).await.unwrap_err();
        assert_eq!(error.kind(), StorageErrorKind::InvalidRequest);

        let error = driver.location("../3").unwrap_err();
        assert_eq!(error.kind(), StorageErrorKind::InvalidRequest);
    }
}

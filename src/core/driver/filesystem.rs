//! Filesystem implementation of the [`Driver`] contract.
//!
//! Generalizes the teacher crate's `storage/driver/filesystem.rs` (which
//! hard-coded blob/tag/upload paths) into a driver that only knows about
//! generic slash-delimited paths rooted at `root_dir`; callers (path
//! mapper, blob store, manifest store) decide what those paths mean.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};

use super::{Driver, Stat, UrlOpts, classify_io_error, validate_path};
use crate::core::errors::CoreError;

pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn ensure_parent(&self, full_path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| classify_io_error(&parent.to_string_lossy(), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for FilesystemDriver {
    async fn get(&self, path: &str) -> Result<Bytes, CoreError> {
        validate_path(path)?;
        let bytes = fs::read(self.resolve(path))
            .await
            .map_err(|e| classify_io_error(path, e))?;
        Ok(Bytes::from(bytes))
    }

    async fn put(&self, path: &str, bytes: Bytes) -> Result<(), CoreError> {
        validate_path(path)?;
        let full_path = self.resolve(path);
        self.ensure_parent(&full_path).await?;

        // Write-then-rename gives the "old contents or new, never a
        // prefix" atomicity the contract requires, matching how
        // blob_store::finalize_upload moves completed upload data into
        // place via the same driver.
        let tmp_path = full_path.with_extension(format!(
            "tmp-{}",
            uuid::Uuid::new_v4().simple()
        ));
        fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| classify_io_error(path, e))?;
        fs::rename(&tmp_path, &full_path)
            .await
            .map_err(|e| classify_io_error(path, e))?;
        Ok(())
    }

    async fn read_stream(
        &self,
        path: &str,
        offset: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, CoreError> {
        validate_path(path)?;
        let mut file = fs::File::open(self.resolve(path))
            .await
            .map_err(|e| classify_io_error(path, e))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| classify_io_error(path, e))?;
        }
        Ok(Box::new(file))
    }

    async fn write_stream(
        &self,
        path: &str,
        offset: u64,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, CoreError> {
        validate_path(path)?;
        let full_path = self.resolve(path);
        self.ensure_parent(&full_path).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&full_path)
            .await
            .map_err(|e| classify_io_error(path, e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| classify_io_error(path, e))?;
        Ok(Box::new(file))
    }

    async fn stat(&self, path: &str) -> Result<Stat, CoreError> {
        validate_path(path)?;
        let metadata = fs::metadata(self.resolve(path))
            .await
            .map_err(|e| classify_io_error(path, e))?;
        Ok(Stat {
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            is_dir: metadata.is_dir(),
        })
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, CoreError> {
        validate_path(path)?;
        let mut read_dir = match fs::read_dir(self.resolve(path)).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(classify_io_error(path, e)),
        };
        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| classify_io_error(path, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }
        entries.sort();
        Ok(entries)
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), CoreError> {
        validate_path(src)?;
        validate_path(dst)?;
        let src_path = self.resolve(src);
        let dst_path = self.resolve(dst);
        self.ensure_parent(&dst_path).await?;
        fs::rename(&src_path, &dst_path)
            .await
            .map_err(|e| classify_io_error(src, e))
    }

    async fn delete(&self, path: &str) -> Result<(), CoreError> {
        validate_path(path)?;
        let full_path = self.resolve(path);
        let metadata = match fs::metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::PathNotFound(path.to_string()));
            }
            Err(e) => return Err(classify_io_error(path, e)),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(&full_path)
                .await
                .map_err(|e| classify_io_error(path, e))
        } else {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| classify_io_error(path, e))
        }
    }

    async fn url_for(&self, _path: &str, _opts: &UrlOpts) -> Result<Option<String>, CoreError> {
        // Filesystem has no redirect story; callers fall back to streaming
        // through `read_stream`.
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());
        driver.put("a/b/c", Bytes::from_static(b"hello")).await.unwrap();
        let got = driver.get("a/b/c").await.unwrap();
        assert_eq!(&got[..], b"hello");
    }

    #[tokio::test]
    async fn get_missing_is_path_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());
        let err = driver.get("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::PathNotFound(_)));
    }

    #[tokio::test]
    async fn rename_moves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());
        driver.put("src", Bytes::from_static(b"data")).await.unwrap();
        driver.rename("src", "dst/nested").await.unwrap();
        assert!(driver.get("src").await.is_err());
        assert_eq!(&driver.get("dst/nested").await.unwrap()[..], b"data");
    }

    #[tokio::test]
    async fn list_direct_children_only() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());
        driver.put("repo/a", Bytes::from_static(b"1")).await.unwrap();
        driver.put("repo/b/c", Bytes::from_static(b"2")).await.unwrap();
        let mut children = driver.list("repo").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["a".to_string(), "b".to_string()]);
    }
}

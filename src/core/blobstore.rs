//! Blob Store (spec §4.C): content-addressable blob storage plus resumable
//! multi-part upload sessions, built on [`Driver`] + [`PathMapper`].
//!
//! Grounded in the teacher's `storage/driver/filesystem.rs` write path and
//! in `other_examples/c44ae6b9_mbr-rockslide__src-registry-storage.rs.rs`'s
//! `finalize_upload` (streaming hash, reject-before-install, atomic
//! rename-into-place).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::core::cache::DescriptorCache;
use crate::core::digest::{Digest, StreamingHasher};
use crate::core::driver::Driver;
use crate::core::errors::{CoreError, ItemError};
use crate::core::paths::PathMapper;

/// Bytes read per chunk while streaming an upload through the finalizer's
/// hasher; kept well below typical blob sizes so memory use stays flat.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Default descriptor cache size when a caller doesn't size it explicitly
/// via [`BlobStore::with_cache_capacity`].
const DEFAULT_CACHE_CAPACITY_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    pub digest: Digest,
    pub size: u64,
}

/// Opaque handle to an in-progress upload session. The session's own state
/// (owning repository, start time) lives on the driver, not in this struct,
/// so a handle can be reconstructed from just an id after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandle {
    pub id: String,
}

impl UploadHandle {
    pub fn existing(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadMeta {
    repo: String,
    started_at_unix: i64,
}

#[derive(Debug, Default)]
pub struct PurgeReport {
    pub deleted: Vec<String>,
    pub errors: Vec<ItemError>,
}

pub struct BlobStore {
    driver: Arc<dyn Driver>,
    paths: PathMapper,
    cache: DescriptorCache,
}

impl BlobStore {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self::with_cache_capacity(driver, DEFAULT_CACHE_CAPACITY_BYTES)
    }

    pub fn with_cache_capacity(driver: Arc<dyn Driver>, cache_capacity_bytes: u64) -> Self {
        Self {
            driver,
            paths: PathMapper::new(),
            cache: DescriptorCache::new(cache_capacity_bytes),
        }
    }

    /// Consults the descriptor cache before asking the driver, so repeated
    /// `HEAD`/pull-through checks for a hot digest don't hit storage every
    /// time.
    pub async fn stat(&self, digest: &Digest) -> Result<BlobDescriptor, CoreError> {
        if let Some(size) = self.cache.get(digest).await {
            return Ok(BlobDescriptor { digest: digest.clone(), size });
        }
        let stat = self
            .driver
            .stat(&self.paths.blob_data_path(digest))
            .await
            .map_err(|e| classify_blob_not_found(e, digest))?;
        self.cache.insert(digest, stat.size).await;
        Ok(BlobDescriptor { digest: digest.clone(), size: stat.size })
    }

    /// Deletes the globally-shared blob bytes and drops the digest from the
    /// descriptor cache. Called only by the expiration scheduler's vacuum
    /// callback; repository links are expected to already be gone by the
    /// time a TTL fires.
    pub async fn evict(&self, digest: &Digest) -> Result<(), CoreError> {
        self.cache.invalidate(digest).await;
        match self.driver.delete(&self.paths.blob_path(digest)).await {
            Ok(()) => Ok(()),
            Err(CoreError::PathNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn open_read(
        &self,
        digest: &Digest,
        offset: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, CoreError> {
        self.driver
            .read_stream(&self.paths.blob_data_path(digest), offset)
            .await
            .map_err(|e| classify_blob_not_found(e, digest))
    }

    /// Convenience for small payloads: hashes in memory and writes
    /// atomically. A concurrent `put_bytes` of identical content by two
    /// callers converges on the same digest and the same bytes on disk,
    /// since the destination path is a pure function of the content.
    pub async fn put_bytes(&self, bytes: Bytes) -> Result<Digest, CoreError> {
        let digest = crate::core::digest::hash_bytes(&bytes);
        self.driver.put(&self.paths.blob_data_path(&digest), bytes).await?;
        Ok(digest)
    }

    pub async fn initiate_upload(&self, repo: &str) -> Result<UploadHandle, CoreError> {
        crate::core::name::validate_name(repo)?;
        let id = Uuid::new_v4().to_string();
        let meta = UploadMeta {
            repo: repo.to_string(),
            started_at_unix: unix_now(),
        };
        let meta_bytes =
            serde_json::to_vec(&meta).expect("UploadMeta is always serializable");
        self.driver
            .put(&self.paths.upload_started_at_path(&id), Bytes::from(meta_bytes))
            .await?;
        self.driver.put(&self.paths.upload_data_path(&id), Bytes::new()).await?;
        Ok(UploadHandle { id })
    }

    /// Callers resume by asking how much has already been durably accepted;
    /// this is simply the current size of the session's data object, which
    /// makes `append_part` naturally idempotent for already-committed
    /// prefixes.
    pub async fn resume_offset(&self, handle: &UploadHandle) -> Result<u64, CoreError> {
        match self.driver.stat(&self.paths.upload_data_path(&handle.id)).await {
            Ok(stat) => Ok(stat.size),
            Err(CoreError::PathNotFound(_)) => {
                Err(CoreError::BlobUploadUnknown(handle.id.clone()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn append_part(
        &self,
        handle: &UploadHandle,
        mut reader: impl AsyncRead + Send + Unpin,
        expected_length: Option<u64>,
    ) -> Result<u64, CoreError> {
        let offset = self.resume_offset(handle).await?;
        let mut writer = self
            .driver
            .write_stream(&self.paths.upload_data_path(&handle.id), offset)
            .await?;
        let copied = tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(CoreError::DriverFailure)?;
        writer.shutdown().await.map_err(CoreError::DriverFailure)?;
        if let Some(expected) = expected_length {
            if copied != expected {
                return Err(CoreError::SizeInvalid(format!(
                    "expected {expected} bytes in this part, received {copied}"
                )));
            }
        }
        Ok(offset + copied)
    }

    /// Streams the accepted parts through a fresh hash (never reusing a
    /// hash computed during `append_part`, since any part could have been
    /// re-sent), rejects before installing on any mismatch, and only then
    /// atomically relocates the data into the global blob namespace and
    /// links it under `repo`.
    pub async fn finalize_upload(
        &self,
        handle: &UploadHandle,
        repo: &str,
        expected_digest: Option<&Digest>,
        expected_size: Option<u64>,
    ) -> Result<Digest, CoreError> {
        let data_path = self.paths.upload_data_path(&handle.id);
        let stat = self
            .driver
            .stat(&data_path)
            .await
            .map_err(|_| CoreError::BlobUploadUnknown(handle.id.clone()))?;

        if let Some(expected) = expected_size {
            if stat.size != expected {
                return Err(CoreError::SizeInvalid(format!(
                    "upload {} has {} bytes, expected {expected}",
                    handle.id, stat.size
                )));
            }
        }

        let mut reader = self.driver.read_stream(&data_path, 0).await?;
        let mut hasher = StreamingHasher::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await.map_err(CoreError::DriverFailure)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hasher.finalize();

        if let Some(expected) = expected_digest {
            if expected.to_string() != digest.to_string() {
                return Err(CoreError::DigestInvalid(format!(
                    "upload {} hashed to {digest}, expected {expected}",
                    handle.id
                )));
            }
        }

        self.driver.rename(&data_path, &self.paths.blob_data_path(&digest)).await?;
        // Best effort: the data file is already relocated, this only
        // removes the now-empty session directory (meta file and dir).
        let _ = self.driver.delete(&self.paths.upload_path(&handle.id)).await;
        self.link(repo, &digest).await?;
        self.cache.insert(&digest, stat.size).await;
        Ok(digest)
    }

    pub async fn abort_upload(&self, handle: &UploadHandle) -> Result<(), CoreError> {
        match self.driver.delete(&self.paths.upload_path(&handle.id)).await {
            Ok(()) | Err(CoreError::PathNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Idempotent: installs the link file only if absent.
    pub async fn link(&self, repo: &str, digest: &Digest) -> Result<(), CoreError> {
        crate::core::name::validate_name(repo)?;
        let path = self.paths.layer_link_path(repo, digest);
        match self.driver.stat(&path).await {
            Ok(_) => Ok(()),
            Err(CoreError::PathNotFound(_)) => {
                let body = format!("{}:{}", digest.algorithm(), digest.digest());
                self.driver.put(&path, Bytes::from(body)).await
            }
            Err(e) => Err(e),
        }
    }

    /// Removes the repository's link to `digest`, the same namespace
    /// `link` installs into; the globally-shared blob bytes themselves are
    /// reclaimed only by the expiration scheduler's vacuum callback, never
    /// by an unlink.
    pub async fn unlink(&self, repo: &str, digest: &Digest) -> Result<(), CoreError> {
        match self.driver.delete(&self.paths.layer_link_path(repo, digest)).await {
            Ok(()) => Ok(()),
            Err(CoreError::PathNotFound(_)) => Err(CoreError::BlobUnknown(digest.to_string())),
            Err(e) => Err(e),
        }
    }

    pub async fn exists_in(&self, repo: &str, digest: &Digest) -> Result<bool, CoreError> {
        match self.driver.stat(&self.paths.layer_link_path(repo, digest)).await {
            Ok(_) => Ok(true),
            Err(CoreError::PathNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deletes every upload session started before `cutoff`; partial
    /// failure is reported per-id rather than aborting the whole sweep.
    pub async fn purge_stale_uploads(&self, cutoff: SystemTime) -> Result<PurgeReport, CoreError> {
        let ids = self.driver.list(&self.paths.uploads_path()).await?;
        let mut report = PurgeReport::default();

        for id in ids {
            let meta_path = self.paths.upload_started_at_path(&id);
            let meta_bytes = match self.driver.get(&meta_path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    report.errors.push(ItemError::new(&id, e));
                    continue;
                }
            };
            let meta: UploadMeta = match serde_json::from_slice(&meta_bytes) {
                Ok(meta) => meta,
                Err(e) => {
                    report.errors.push(ItemError::new(&id, e));
                    continue;
                }
            };
            let started_at = UNIX_EPOCH + Duration::from_secs(meta.started_at_unix.max(0) as u64);
            if started_at >= cutoff {
                continue;
            }
            match self.driver.delete(&self.paths.upload_path(&id)).await {
                Ok(()) => report.deleted.push(id),
                Err(e) => report.errors.push(ItemError::new(&id, e)),
            }
        }

        Ok(report)
    }
}

fn classify_blob_not_found(err: CoreError, digest: &Digest) -> CoreError {
    match err {
        CoreError::PathNotFound(_) => CoreError::BlobUnknown(digest.to_string()),
        other => other,
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::filesystem::FilesystemDriver;
    use tokio::io::AsyncReadExt;

    fn store() -> (BlobStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FilesystemDriver::new(dir.path()));
        (BlobStore::new(driver), dir)
    }

    #[tokio::test]
    async fn put_bytes_then_stat_and_read() {
        let (store, _dir) = store();
        let digest = store.put_bytes(Bytes::from_static(b"layer contents")).await.unwrap();
        let descriptor = store.stat(&digest).await.unwrap();
        assert_eq!(descriptor.size, "layer contents".len() as u64);
        let mut buf = Vec::new();
        store.open_read(&digest, 0).await.unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"layer contents");
    }

    #[tokio::test]
    async fn stat_unknown_digest_is_blob_unknown() {
        let (store, _dir) = store();
        let digest = crate::core::digest::hash_bytes(b"never written");
        let err = store.stat(&digest).await.unwrap_err();
        assert!(matches!(err, CoreError::BlobUnknown(_)));
    }

    #[tokio::test]
    async fn resumable_upload_round_trips_and_links() {
        let (store, _dir) = store();
        let handle = store.initiate_upload("library/alpine").await.unwrap();
        assert_eq!(store.resume_offset(&handle).await.unwrap(), 0);

        let offset = store
            .append_part(&handle, &b"hello "[..], None)
            .await
            .unwrap();
        assert_eq!(offset, 6);
        let offset = store
            .append_part(&handle, &b"world"[..], Some(5))
            .await
            .unwrap();
        assert_eq!(offset, 11);

        let expected = crate::core::digest::hash_bytes(b"hello world");
        let digest = store
            .finalize_upload(&handle, "library/alpine", Some(&expected), Some(11))
            .await
            .unwrap();
        assert_eq!(digest.to_string(), expected.to_string());
        assert!(store.exists_in("library/alpine", &digest).await.unwrap());
    }

    #[tokio::test]
    async fn finalize_rejects_digest_mismatch_without_installing() {
        let (store, _dir) = store();
        let handle = store.initiate_upload("library/alpine").await.unwrap();
        store.append_part(&handle, &b"actual bytes"[..], None).await.unwrap();
        let wrong = crate::core::digest::hash_bytes(b"different bytes");
        let err = store
            .finalize_upload(&handle, "library/alpine", Some(&wrong), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DigestInvalid(_)));
        assert!(store.stat(&wrong).await.is_err());
    }

    #[tokio::test]
    async fn abort_upload_removes_session_state() {
        let (store, _dir) = store();
        let handle = store.initiate_upload("library/alpine").await.unwrap();
        store.append_part(&handle, &b"partial"[..], None).await.unwrap();
        store.abort_upload(&handle).await.unwrap();
        assert!(matches!(
            store.resume_offset(&handle).await.unwrap_err(),
            CoreError::BlobUploadUnknown(_)
        ));
    }

    #[tokio::test]
    async fn unlink_removes_repo_link_but_not_content() {
        let (store, _dir) = store();
        let digest = store.put_bytes(Bytes::from_static(b"layer")).await.unwrap();
        store.link("library/alpine", &digest).await.unwrap();
        assert!(store.exists_in("library/alpine", &digest).await.unwrap());

        store.unlink("library/alpine", &digest).await.unwrap();
        assert!(!store.exists_in("library/alpine", &digest).await.unwrap());
        assert!(store.stat(&digest).await.is_ok());
    }

    #[tokio::test]
    async fn evict_clears_cached_descriptor_and_content() {
        let (store, _dir) = store();
        let digest = store.put_bytes(Bytes::from_static(b"layer contents")).await.unwrap();
        // warm the cache
        store.stat(&digest).await.unwrap();

        store.evict(&digest).await.unwrap();
        assert!(matches!(store.stat(&digest).await.unwrap_err(), CoreError::BlobUnknown(_)));
    }

    #[tokio::test]
    async fn purge_stale_uploads_reports_deleted_ids() {
        let (store, _dir) = store();
        let handle = store.initiate_upload("library/alpine").await.unwrap();
        let report = store
            .purge_stale_uploads(SystemTime::now() + Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(report.deleted, vec![handle.id]);
        assert!(report.errors.is_empty());
    }
}

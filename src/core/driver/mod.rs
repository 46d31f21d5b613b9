//! Storage Driver Contract (spec §4.A).
//!
//! The core depends on nothing but this trait: a byte-oriented object
//! namespace of case-sensitive, slash-delimited paths. `filesystem`
//! below is the one driver shipped in this repository; S3/GCS/etc.
//! drivers are explicitly out of scope (spec §1) and can be added by
//! implementing [`Driver`] without touching anything above it.

pub mod filesystem;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::LazyLock;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::errors::CoreError;

/// Metadata returned by [`Driver::stat`].
#[derive(Debug, Clone)]
pub struct Stat {
    pub size: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
}

/// Options accepted by [`Driver::url_for`]; empty today, reserved for a
/// future redirect-based driver (S3 presigned URLs and similar).
#[derive(Debug, Clone, Default)]
pub struct UrlOpts {
    pub expires_in_secs: Option<u64>,
}

static PATH_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9._/-]*[A-Za-z0-9])?$").unwrap());

/// Validates driver paths against the single grammar required by spec
/// §4.A: any operation given an invalid path MUST fail with
/// `invalid-path` and make no state change. This is checked centrally so
/// every driver implementation gets it for free.
pub fn validate_path(path: &str) -> Result<(), CoreError> {
    if path.is_empty() || path.contains("..") || !PATH_RE.is_match(path) {
        return Err(CoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Abstract byte-oriented object store (spec §4.A).
#[async_trait]
pub trait Driver: Send + Sync {
    /// Reads the whole object at `path`.
    async fn get(&self, path: &str) -> Result<Bytes, CoreError>;

    /// Writes `bytes` atomically: a concurrent reader observes either the
    /// old contents or the new, never a prefix.
    async fn put(&self, path: &str, bytes: Bytes) -> Result<(), CoreError>;

    /// Opens a readable stream starting at `offset`.
    async fn read_stream(
        &self,
        path: &str,
        offset: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, CoreError>;

    /// Returns a writer positioned at `offset`; bytes written through it
    /// must be visible to subsequent reads once the writer is dropped /
    /// flushed by the caller.
    async fn write_stream(
        &self,
        path: &str,
        offset: u64,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, CoreError>;

    /// `size`/`mod-time`/`is-dir` of `path`.
    async fn stat(&self, path: &str) -> Result<Stat, CoreError>;

    /// Direct children of the virtual directory `path`.
    async fn list(&self, path: &str) -> Result<Vec<String>, CoreError>;

    /// Atomic rename; `dst` is replaced if present.
    async fn rename(&self, src: &str, dst: &str) -> Result<(), CoreError>;

    /// Recursive delete.
    async fn delete(&self, path: &str) -> Result<(), CoreError>;

    /// Optional redirect URL for `path`; `Ok(None)` means unsupported by
    /// this driver (not an error).
    async fn url_for(&self, _path: &str, _opts: &UrlOpts) -> Result<Option<String>, CoreError> {
        Ok(None)
    }
}

/// Maps a `std::io::Error` from a driver implementation into the
/// `path-not-found` vs `driver-failure` split required by spec §4.A.
/// Callers above the driver (blob store, manifest store) are the
/// "component boundary" that further classifies `PathNotFound` into
/// `BLOB_UNKNOWN`/`MANIFEST_UNKNOWN`/`NAME_UNKNOWN`.
pub fn classify_io_error(path: &str, err: std::io::Error) -> CoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CoreError::PathNotFound(path.to_string())
    } else {
        CoreError::DriverFailure(err)
    }
}

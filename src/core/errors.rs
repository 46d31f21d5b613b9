//! The stable error taxonomy of spec §7, independent of any HTTP mapping.
//!
//! `CoreError` is what every `core::*` operation returns on failure. The
//! HTTP adapter (`crate::error::OciError`) owns the translation to status
//! codes; nothing in this module knows about axum.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("the operation is unsupported by this configuration")]
    Unsupported,

    #[error("access denied: {0}")]
    Unauthorized(String),

    #[error("digest invalid: {0}")]
    DigestInvalid(String),

    #[error("size invalid: {0}")]
    SizeInvalid(String),

    #[error("repository name invalid: {0}")]
    NameInvalid(String),

    #[error("tag invalid: {0}")]
    TagInvalid(String),

    #[error("repository unknown: {0}")]
    NameUnknown(String),

    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("manifest unverified: {0}")]
    ManifestUnverified(String),

    #[error("manifest references unknown blob: {0}")]
    ManifestBlobUnknown(String),

    #[error("blob unknown: {0}")]
    BlobUnknown(String),

    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// The underlying storage driver reported a path that does not match
    /// any path pattern the mapper issues; translated to this rather than
    /// leaking driver-specific detail.
    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    /// Raw "absent" signal from the driver, before a component boundary
    /// has classified it into `BLOB_UNKNOWN`/`MANIFEST_UNKNOWN`/
    /// `NAME_UNKNOWN` based on which path pattern failed (spec §7:
    /// "translated once, at the component boundary").
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// A driver failure that isn't a `path-not-found`: propagated
    /// unchanged per §7 ("unknown driver errors are wrapped, not hidden").
    #[error("storage driver failure: {0}")]
    DriverFailure(#[source] std::io::Error),

    /// A failure contacting or parsing a response from the upstream
    /// remote registry (spec §4.F); wrapped rather than hidden, the same
    /// policy spec §7 applies to unknown driver errors.
    #[error("remote registry failure: {0}")]
    RemoteFailure(#[source] anyhow::Error),

    #[error("operation was canceled")]
    Canceled,
}

impl CoreError {
    /// Stable uppercase code, matching the `code` column of spec §7's table.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unsupported => "UNSUPPORTED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::DigestInvalid(_) => "DIGEST_INVALID",
            Self::SizeInvalid(_) => "SIZE_INVALID",
            Self::NameInvalid(_) => "NAME_INVALID",
            Self::TagInvalid(_) => "TAG_INVALID",
            Self::NameUnknown(_) => "NAME_UNKNOWN",
            Self::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            Self::ManifestInvalid(_) => "MANIFEST_INVALID",
            Self::ManifestUnverified(_) => "MANIFEST_UNVERIFIED",
            Self::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            Self::BlobUnknown(_) => "BLOB_UNKNOWN",
            Self::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            Self::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            Self::InvalidPath(_) => "UNSUPPORTED",
            Self::PathNotFound(_) => "UNSUPPORTED",
            Self::DriverFailure(_) => "UNSUPPORTED",
            Self::RemoteFailure(_) => "UNSUPPORTED",
            Self::Canceled => "UNSUPPORTED",
        }
    }
}

/// Per-item outcome used by partial-failure operations (purge, migrate).
#[derive(Debug, Clone)]
pub struct ItemError {
    pub key: String,
    pub message: String,
}

impl ItemError {
    pub fn new(key: impl Into<String>, message: impl ToString) -> Self {
        Self {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

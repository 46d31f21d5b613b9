//! The storage- and protocol-independent core of the registry.
//!
//! Everything under `core` is deliberately unaware of axum, HTTP status
//! codes, or sqlx: it operates purely in terms of repositories, digests,
//! manifests, and driver paths. The `service`/`api` modules are the HTTP
//! adapter that sits on top of it (see `error::OciError`'s
//! `From<core::errors::CoreError>` impl for the seam).

pub mod access;
pub mod blobstore;
pub mod cache;
pub mod digest;
pub mod driver;
pub mod errors;
pub mod manifeststore;
pub mod migration;
pub mod name;
pub mod paths;
pub mod proxy;
pub mod remote;
pub mod scheduler;

pub use errors::CoreError;

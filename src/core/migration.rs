//! Enumerator + Migration Driver (spec §4.G).
//!
//! Walks every repository and tag the storage driver knows about and hands
//! each `(repo, tag, descriptor)` to a per-tag `handler`, persisting a
//! per-repository resume marker so the walk can restart in the middle of
//! an interrupted run. No teacher file does this (the teacher has no
//! migration concept at all); grounded in `core::scheduler`'s own
//! durable-state pattern (load-on-start, flush-on-mutation through the
//! same [`Driver`]) since spec §4.G's marker has the identical durability
//! shape as a scheduler entry, just singular instead of a heap.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::core::digest::Digest;
use crate::core::driver::Driver;
use crate::core::errors::CoreError;
use crate::core::manifeststore::ManifestStore;
use crate::core::paths::PathMapper;

/// What the per-tag handler receives about a tag beyond its name: the
/// manifest revision it currently resolves to. Kept minimal — handlers
/// that need the manifest body call back into [`ManifestStore::get_manifest`].
#[derive(Debug, Clone)]
pub struct TagDescriptor {
    pub manifest_digest: Digest,
}

/// Per-tag callback invoked during a migration pass. Errors are logged and
/// swallowed by the driver (spec §4.G error policy) — a handler that wants
/// to abort the whole run has no mechanism to do so by design.
#[async_trait]
pub trait MigrationHandler: Send + Sync {
    async fn handle(&self, repo: &str, tag: &str, descriptor: &TagDescriptor) -> Result<(), CoreError>;
}

/// A single emitted migration record: `(repo, tag, manifest-digest)`,
/// destined for "an external catalog" per spec §1. [`MigrationSink`] is
/// the seam the ambient SQL catalog implements (see `domain::migration`);
/// core stays free of any sqlx dependency.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub repo: String,
    pub tag: String,
    pub manifest_digest: Digest,
}

#[async_trait]
pub trait MigrationSink: Send + Sync {
    async fn emit(&self, record: MigrationRecord) -> Result<(), CoreError>;
}

/// Adapts any [`MigrationSink`] into a [`MigrationHandler`].
pub struct SinkHandler<S: MigrationSink> {
    sink: Arc<S>,
}

impl<S: MigrationSink> SinkHandler<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S: MigrationSink> MigrationHandler for SinkHandler<S> {
    async fn handle(&self, repo: &str, tag: &str, descriptor: &TagDescriptor) -> Result<(), CoreError> {
        self.sink
            .emit(MigrationRecord {
                repo: repo.to_string(),
                tag: tag.to_string(),
                manifest_digest: descriptor.manifest_digest.clone(),
            })
            .await
    }
}

/// Outcome of one `migrate` call: the last repository attempted (`None`
/// only if enumeration itself produced no names), and the terminal error,
/// if any (spec §4.G step 3: "the last repository attempted plus a
/// terminal error (or nil)").
#[derive(Debug, Default)]
pub struct MigrationOutcome {
    pub last_repository: Option<String>,
    pub error: Option<CoreError>,
}

pub struct MigrationDriver {
    driver: Arc<dyn Driver>,
    manifests: Arc<ManifestStore>,
    paths: PathMapper,
}

impl MigrationDriver {
    pub fn new(driver: Arc<dyn Driver>, manifests: Arc<ManifestStore>) -> Self {
        Self { driver, manifests, paths: PathMapper::new() }
    }

    /// The repository whose migration last completed, or `None` if no
    /// migration has ever run to completion on this storage.
    pub async fn current_marker(&self) -> Result<Option<String>, CoreError> {
        match self.driver.get(&self.paths.migration_state_path()).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).trim().to_string())),
            Err(CoreError::PathNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn persist_marker(&self, name: &str) -> Result<(), CoreError> {
        self.driver
            .put(&self.paths.migration_state_path(), Bytes::from(name.to_string()))
            .await
    }

    /// Runs one migration pass. When `resume` is true, repositories
    /// lexicographically before the persisted marker are skipped and the
    /// marker's own repository is re-walked (spec property 7: "Rₖ may be
    /// re-emitted; R<ₖ are not").
    ///
    /// Per-tag and per-repository errors are logged and the walk
    /// continues; the resume marker still advances past a repository that
    /// errored (spec §9 Open Question, resolved as "advance regardless" to
    /// match the per-repository resume granularity). The only fatal
    /// outcome is a failure enumerating repository names at all.
    pub async fn migrate(&self, handler: &dyn MigrationHandler, resume: bool) -> MigrationOutcome {
        let repos = match self.enumerate_repositories().await {
            Ok(repos) => repos,
            Err(e) => return MigrationOutcome { last_repository: None, error: Some(e) },
        };

        let resume_marker = if resume {
            match self.current_marker().await {
                Ok(marker) => marker,
                Err(e) => return MigrationOutcome { last_repository: None, error: Some(e) },
            }
        } else {
            None
        };

        let mut reached = resume_marker.is_none();
        let mut last_repository = None;

        for repo in &repos {
            if !reached {
                if resume_marker.as_deref() == Some(repo.as_str()) {
                    reached = true;
                } else {
                    continue;
                }
            }

            last_repository = Some(repo.clone());

            match self.manifests.list_tags(repo).await {
                Ok(tags) => {
                    for tag in tags {
                        match self.manifests.get_tag(repo, &tag).await {
                            Ok(manifest_digest) => {
                                let descriptor = TagDescriptor { manifest_digest };
                                if let Err(e) = handler.handle(repo, &tag, &descriptor).await {
                                    warn!(repo = %repo, tag = %tag, error = %e, "migration handler failed, continuing");
                                }
                            }
                            Err(e) => {
                                warn!(repo = %repo, tag = %tag, error = %e, "failed to resolve tag during migration, continuing");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(repo = %repo, error = %e, "failed to list tags during migration, continuing");
                }
            }

            if let Err(e) = self.persist_marker(repo).await {
                return MigrationOutcome { last_repository, error: Some(e) };
            }
        }

        MigrationOutcome { last_repository, error: None }
    }

    /// Recursively walks `repositories/` to find every leaf directory that
    /// is a repository (identified by the presence of its `_manifests`
    /// subdirectory, the way `core::paths::PathMapper::manifests_path`
    /// always nests it) rather than an intermediate namespace component
    /// (spec §3: names may have up to five slash-delimited components).
    ///
    /// Returns names in lexicographic order. The driver's own `list` order
    /// is not guaranteed stable across calls, so enumeration order is
    /// normalized here — a deliberate choice, not specified by spec §4.G,
    /// made so the resume marker comparison in `migrate` is well defined
    /// regardless of driver implementation.
    async fn enumerate_repositories(&self) -> Result<Vec<String>, CoreError> {
        let mut found = Vec::new();
        let mut stack = vec![String::new()];

        while let Some(prefix) = stack.pop() {
            let list_path = if prefix.is_empty() {
                "repositories".to_string()
            } else {
                format!("repositories/{prefix}")
            };
            let children = match self.driver.list(&list_path).await {
                Ok(children) => children,
                Err(CoreError::PathNotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            for child in children {
                let name = if prefix.is_empty() { child } else { format!("{prefix}/{child}") };
                match self.driver.stat(&format!("repositories/{name}/_manifests")).await {
                    Ok(_) => found.push(name),
                    Err(CoreError::PathNotFound(_)) => stack.push(name),
                    Err(e) => return Err(e),
                }
            }
        }

        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::blobstore::BlobStore;
    use crate::core::driver::filesystem::FilesystemDriver;
    use bytes::Bytes;
    use oci_spec::image::{DescriptorBuilder, ImageManifestBuilder, MediaType};
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingSink {
        records: AsyncMutex<Vec<MigrationRecord>>,
    }

    #[async_trait]
    impl MigrationSink for RecordingSink {
        async fn emit(&self, record: MigrationRecord) -> Result<(), CoreError> {
            self.records.lock().await.push(record);
            Ok(())
        }
    }

    async fn seed_repo(driver: Arc<dyn Driver>, blobs: &BlobStore, manifests: &ManifestStore, repo: &str, tag: &str) {
        let config_digest = blobs.put_bytes(Bytes::from_static(b"config")).await.unwrap();
        blobs.link(repo, &config_digest).await.unwrap();
        let layer_digest = blobs.put_bytes(Bytes::from_static(b"layer")).await.unwrap();
        blobs.link(repo, &layer_digest).await.unwrap();

        let config = DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .digest(config_digest)
            .size(0u64)
            .build()
            .unwrap();
        let layer = DescriptorBuilder::default()
            .media_type(MediaType::ImageLayerGzip)
            .digest(layer_digest)
            .size(0u64)
            .build()
            .unwrap();
        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .config(config)
            .layers(vec![layer])
            .build()
            .unwrap();
        let bytes = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        let revision = manifests.put_manifest(repo, bytes, None).await.unwrap();
        manifests.put_tag(repo, tag, &revision).await.unwrap();
        let _ = driver;
    }

    async fn fixtures() -> (MigrationDriver, Arc<BlobStore>, Arc<ManifestStore>, Arc<dyn Driver>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let driver: Arc<dyn Driver> = Arc::new(FilesystemDriver::new(dir.path()));
        let blobs = Arc::new(BlobStore::new(driver.clone()));
        let manifests = Arc::new(ManifestStore::new(driver.clone(), blobs.clone()));
        let migration = MigrationDriver::new(driver.clone(), manifests.clone());
        (migration, blobs, manifests, driver, dir)
    }

    #[tokio::test]
    async fn migrate_emits_every_repo_and_tag() {
        let (migration, blobs, manifests, driver, _dir) = fixtures().await;
        seed_repo(driver.clone(), &blobs, &manifests, "admin/a-repo", "latest").await;
        seed_repo(driver.clone(), &blobs, &manifests, "admin/b-repo", "latest").await;

        let sink = Arc::new(RecordingSink::default());
        let handler = SinkHandler::new(sink.clone());
        let outcome = migration.migrate(&handler, false).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.last_repository.as_deref(), Some("admin/b-repo"));
        let records = sink.records.lock().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].repo, "admin/a-repo");
        assert_eq!(records[1].repo, "admin/b-repo");
    }

    #[tokio::test]
    async fn migrate_is_idempotent_on_rerun() {
        let (migration, blobs, manifests, driver, _dir) = fixtures().await;
        seed_repo(driver.clone(), &blobs, &manifests, "admin/a-repo", "latest").await;

        let sink = Arc::new(RecordingSink::default());
        let handler = SinkHandler::new(sink.clone());
        migration.migrate(&handler, false).await;
        migration.migrate(&handler, false).await;

        let records = sink.records.lock().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].manifest_digest.to_string(), records[1].manifest_digest.to_string());
    }

    #[tokio::test]
    async fn resume_skips_repositories_before_the_marker() {
        let (migration, blobs, manifests, driver, _dir) = fixtures().await;
        seed_repo(driver.clone(), &blobs, &manifests, "admin/a-repo", "latest").await;
        seed_repo(driver.clone(), &blobs, &manifests, "admin/b-repo", "latest").await;

        migration.persist_marker("admin/b-repo").await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let handler = SinkHandler::new(sink.clone());
        let outcome = migration.migrate(&handler, true).await;

        assert!(outcome.error.is_none());
        let records = sink.records.lock().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].repo, "admin/b-repo");
    }
}

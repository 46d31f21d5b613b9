use std::sync::Arc;
use std::time::Duration;

use sqlx::{Pool, Sqlite};

use crate::config::Config;
use crate::core::blobstore::BlobStore;
use crate::core::driver::Driver;
use crate::core::driver::filesystem::FilesystemDriver;
use crate::core::manifeststore::ManifestStore;
use crate::core::proxy::{ProxyCoordinator, Vacuum};
use crate::core::remote::{HttpRemoteRegistry, RemoteConfig, SharedRemote};
use crate::core::scheduler::Scheduler;
use crate::domain::repo::{RepoRepository, SqliteRepoRepository};
use crate::domain::user::{SqliteUserRepository, UserRepository};

const BLOB_KIND: &str = "blob";
const MANIFEST_KIND: &str = "manifest";

#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<dyn Driver>,
    pub blobs: Arc<BlobStore>,
    pub manifests: Arc<ManifestStore>,
    pub scheduler: Arc<Scheduler>,
    /// Present only when `proxy.remote-url` is configured; absent, this
    /// registry serves only what has been pushed to it directly.
    pub proxy: Option<Arc<ProxyCoordinator>>,
    pub user_storage: Arc<dyn UserRepository>,
    pub repo_storage: Arc<dyn RepoRepository>,
    /// Kept alongside `user_storage`/`repo_storage` so callers outside the
    /// request path (the `migrate` CLI subcommand) can build their own
    /// sqlx-backed components, such as `domain::migration::SqliteMigrationSink`.
    pub pool: Arc<Pool<Sqlite>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub async fn new(config: Config, pool: Arc<Pool<Sqlite>>) -> Self {
        let driver: Arc<dyn Driver> = match config.storge_type.as_str() {
            "FILESYSTEM" => Arc::new(FilesystemDriver::new(config.root_dir.clone())),
            other => {
                tracing::warn!(driver = %other, "unrecognized storage.driver, falling back to filesystem");
                Arc::new(FilesystemDriver::new(config.root_dir.clone()))
            }
        };

        let blobs = Arc::new(BlobStore::new(driver.clone()));
        let manifests = Arc::new(ManifestStore::with_signature_policy(
            driver.clone(),
            blobs.clone(),
            config.manifest_require_signatures,
            config.auth_trusted_keys.clone(),
        ));

        let mut scheduler = Scheduler::with_state_path(driver.clone(), config.scheduler_state_path.clone());
        scheduler.register(BLOB_KIND, Arc::new(Vacuum::new(driver.clone())));
        scheduler.register(MANIFEST_KIND, Arc::new(Vacuum::new(driver.clone())));
        let scheduler = Arc::new(scheduler);
        scheduler.start().await;

        let proxy = config.proxy_remote_url.as_ref().map(|remote_url| {
            let remote: SharedRemote = Arc::new(HttpRemoteRegistry::new(RemoteConfig {
                base_url: remote_url.clone(),
                username: config.proxy_username.clone(),
                password: config.proxy_password.clone(),
            }));
            Arc::new(ProxyCoordinator::new(
                blobs.clone(),
                manifests.clone(),
                remote,
                scheduler.clone(),
                Duration::from_secs(config.proxy_ttl_blob_secs),
                Duration::from_secs(config.proxy_ttl_manifest_secs),
            ))
        });

        AppState {
            driver,
            blobs,
            manifests,
            scheduler,
            proxy,
            user_storage: Arc::new(SqliteUserRepository::new(pool.clone())),
            repo_storage: Arc::new(SqliteRepoRepository::new(pool.clone())),
            pool,
            config: Arc::new(config),
        }
    }
}

//! Drives the OCI v2 router end to end against a `FilesystemDriver` rooted
//! at a tempdir, covering S1/S2/S3 from spec.md's testable-properties list:
//! cold pull through a proxy, warm pull (no outbound refetch), and a
//! digest-mismatched push rejected before anything is installed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use bytes::Bytes;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::io::AsyncRead;
use tower::ServiceExt;

use distribution::api::create_router;
use distribution::config::Config;
use distribution::core::blobstore::BlobStore;
use distribution::core::digest::{self, Digest};
use distribution::core::driver::Driver;
use distribution::core::driver::filesystem::FilesystemDriver;
use distribution::core::errors::CoreError;
use distribution::core::manifeststore::ManifestStore;
use distribution::core::proxy::{ProxyCoordinator, Vacuum};
use distribution::core::remote::{RemoteRegistry, SharedRemote};
use distribution::core::scheduler::Scheduler;
use distribution::domain::repo::SqliteRepoRepository;
use distribution::domain::user::SqliteUserRepository;
use distribution::utils::jwt::gen_token;
use distribution::utils::state::AppState;

const JWT_SECRET: &str = "test-secret";
const BLOB_KIND: &str = "blob";
const MANIFEST_KIND: &str = "manifest";

/// Serves one fixed blob regardless of what is asked for, standing in for
/// an upstream registry that owns `library/alpine:latest`. Counts
/// `head_manifest_digest` calls so tests can assert spec §8 property S2
/// ("zero outbound requests to R" on a warm, within-TTL repeat) directly,
/// rather than merely failing to observe a regression.
struct StaticRemote {
    body: Bytes,
    digest: Digest,
    head_calls: AtomicUsize,
}

impl StaticRemote {
    fn call_count(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteRegistry for StaticRemote {
    async fn head_manifest_digest(&self, _repo: &str, _reference: &str) -> Result<Digest, CoreError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.digest.clone())
    }

    async fn get_manifest(&self, _repo: &str, _reference: &str) -> Result<(Bytes, Digest, String), CoreError> {
        Ok((
            self.body.clone(),
            self.digest.clone(),
            "application/vnd.oci.image.manifest.v1+json".to_string(),
        ))
    }

    async fn get_blob_stream(
        &self,
        _repo: &str,
        _digest: &Digest,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, CoreError> {
        Ok(Box::new(std::io::Cursor::new(self.body.to_vec())))
    }
}

fn test_config(root_dir: &std::path::Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        storge_type: "FILESYSTEM".to_string(),
        root_dir: root_dir.display().to_string(),
        registry_url: "http://localhost".to_string(),
        db_url: "sqlite::memory:".to_string(),
        password_salt: "unused".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        jwt_lifetime_secs: 3600,
        github_client_id: String::new(),
        github_client_secret: String::new(),
        proxy_remote_url: None,
        proxy_username: None,
        proxy_password: None,
        proxy_ttl_blob_secs: 60,
        proxy_ttl_manifest_secs: 60,
        scheduler_state_path: None,
        upload_stale_cutoff_secs: 7 * 24 * 3600,
        auth_trusted_issuers: Vec::new(),
        auth_accepted_audiences: Vec::new(),
        auth_trusted_keys: Vec::new(),
        manifest_require_signatures: false,
        proxy_min_throughput_bps: 1_000_000,
    }
}

async fn test_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite connects");
    sqlx::migrate!("./migrations").run(&pool).await.expect("migrations apply");
    pool
}

/// Builds an `AppState` with a proxy wired to `StaticRemote`, mirroring
/// `AppState::new` but substituting the upstream so S1/S2 need no network.
/// Returns the concrete `StaticRemote` alongside the state so tests can
/// inspect `call_count()` after driving requests through the router.
async fn proxied_state(dir: &std::path::Path, blob_body: &'static [u8]) -> (Arc<AppState>, Arc<StaticRemote>) {
    let driver: Arc<dyn Driver> = Arc::new(FilesystemDriver::new(dir));
    let blobs = Arc::new(BlobStore::new(driver.clone()));
    let manifests = Arc::new(ManifestStore::new(driver.clone(), blobs.clone()));

    let mut scheduler = Scheduler::new(driver.clone());
    scheduler.register(BLOB_KIND, Arc::new(Vacuum::new(driver.clone())));
    scheduler.register(MANIFEST_KIND, Arc::new(Vacuum::new(driver.clone())));
    let scheduler = Arc::new(scheduler);
    scheduler.start().await;

    let blob_digest = digest::hash_bytes(blob_body);
    let remote = Arc::new(StaticRemote {
        body: Bytes::from_static(blob_body),
        digest: blob_digest,
        head_calls: AtomicUsize::new(0),
    });
    let remote_shared: SharedRemote = remote.clone();
    let proxy = Arc::new(ProxyCoordinator::new(
        blobs.clone(),
        manifests.clone(),
        remote_shared,
        scheduler.clone(),
        Duration::from_secs(60),
        Duration::from_secs(60),
    ));

    let pool = Arc::new(test_pool().await);
    let state = Arc::new(AppState {
        driver,
        blobs,
        manifests,
        scheduler,
        proxy: Some(proxy),
        user_storage: Arc::new(SqliteUserRepository::new(pool.clone())),
        repo_storage: Arc::new(SqliteRepoRepository::new(pool.clone())),
        pool,
        config: Arc::new(test_config(dir)),
    });
    (state, remote)
}

/// No proxy configured: every blob must be pushed before it can be read.
async fn direct_state(dir: &std::path::Path) -> Arc<AppState> {
    let driver: Arc<dyn Driver> = Arc::new(FilesystemDriver::new(dir));
    let blobs = Arc::new(BlobStore::new(driver.clone()));
    let manifests = Arc::new(ManifestStore::new(driver.clone(), blobs.clone()));
    let scheduler = Arc::new(Scheduler::new(driver.clone()));

    let pool = Arc::new(test_pool().await);
    Arc::new(AppState {
        driver,
        blobs,
        manifests,
        scheduler,
        proxy: None,
        user_storage: Arc::new(SqliteUserRepository::new(pool.clone())),
        repo_storage: Arc::new(SqliteRepoRepository::new(pool.clone())),
        pool,
        config: Arc::new(test_config(dir)),
    })
}

fn bearer_for(namespace: &str) -> String {
    format!("Bearer {}", gen_token(3600, JWT_SECRET, namespace))
}

/// S1 (cache cold) + S2 (cache warm): the first GET of `library/alpine`'s
/// manifest pulls through `StaticRemote`; the second is served from local
/// storage, byte-identical and without any additional outbound call to the
/// upstream registry (spec §8 property S2: "zero outbound requests to R").
#[tokio::test]
async fn pulls_manifest_through_proxy_then_serves_it_warm() {
    let dir = tempfile::tempdir().unwrap();
    let (state, remote) = proxied_state(dir.path(), b"layer-bytes").await;
    let router = create_router(state);

    let request = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, bearer_for("library"))
            .body(Body::empty())
            .unwrap()
    };

    let cold = router
        .clone()
        .oneshot(request("/v2/library/alpine/manifests/latest"))
        .await
        .unwrap();
    assert_eq!(cold.status(), StatusCode::OK);
    let cold_digest = cold
        .headers()
        .get("Docker-Content-Digest")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let cold_body = axum::body::to_bytes(cold.into_body(), usize::MAX).await.unwrap();

    let warm = router
        .clone()
        .oneshot(request("/v2/library/alpine/manifests/latest"))
        .await
        .unwrap();
    assert_eq!(warm.status(), StatusCode::OK);
    let warm_digest = warm
        .headers()
        .get("Docker-Content-Digest")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let warm_body = axum::body::to_bytes(warm.into_body(), usize::MAX).await.unwrap();

    assert_eq!(cold_digest, warm_digest);
    assert_eq!(cold_body, warm_body);
    assert_eq!(remote.call_count(), 1, "warm read within TTL must not re-contact upstream");
}

/// S3 (corrupt finalize): pushing a blob whose actual content digest
/// disagrees with the caller-supplied `digest` query parameter must fail
/// with `DIGEST_INVALID` and must not install the blob.
#[tokio::test]
async fn monolithic_push_rejects_mismatched_digest() {
    let dir = tempfile::tempdir().unwrap();
    let state = direct_state(dir.path()).await;
    let router = create_router(state.clone());

    let body = b"hello world".to_vec();
    let bogus_digest = "sha256:0000000000000000000000000000000000000000000000000000000000000000";

    let request = Request::builder()
        .method("POST")
        .uri(format!("/v2/library/alpine/blobs/uploads/?digest={bogus_digest}"))
        .header(header::AUTHORIZATION, bearer_for("library"))
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let payload = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(json["errors"][0]["code"], "DIGEST_INVALID");

    let actual_digest = digest::hash_bytes(b"hello world");
    assert!(!state.blobs.exists_in("library/alpine", &actual_digest).await.unwrap());
}

/// A plain monolithic push with a correct digest round-trips through GET.
#[tokio::test]
async fn pushed_blob_is_then_readable() {
    let dir = tempfile::tempdir().unwrap();
    let state = direct_state(dir.path()).await;
    let router = create_router(state);

    let body = b"layer-contents".to_vec();
    let digest = digest::hash_bytes(&body);

    let push = Request::builder()
        .method("POST")
        .uri(format!("/v2/library/alpine/blobs/uploads/?digest={digest}"))
        .header(header::AUTHORIZATION, bearer_for("library"))
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body.clone()))
        .unwrap();

    let pushed = router.clone().oneshot(push).await.unwrap();
    assert_eq!(pushed.status(), StatusCode::CREATED);

    let get = Request::builder()
        .uri(format!("/v2/library/alpine/blobs/{digest}"))
        .header(header::AUTHORIZATION, bearer_for("library"))
        .body(Body::empty())
        .unwrap();
    let fetched = router.oneshot(get).await.unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);
    let fetched_body = axum::body::to_bytes(fetched.into_body(), usize::MAX).await.unwrap();
    assert_eq!(fetched_body, Bytes::from(body));
}

//! Upstream registry client (spec §4.F, §6 `proxy.*` config): fetches
//! manifests and blobs from the remote being proxied, exchanging basic-auth
//! credentials for a bearer token the way `docker`/`containerd` do against
//! a `WWW-Authenticate: Bearer realm=...` challenge.
//!
//! Grounded in the teacher's `service/auth.rs` (the only `reqwest` call
//! site in the crate: builds a `reqwest::Client`, issues a `POST`, reads a
//! JSON token response) generalized from GitHub OAuth to the generic OCI
//! token endpoint described in the distribution spec.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tokio_util::io::StreamReader;

use crate::core::digest::Digest;
use crate::core::errors::CoreError;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[async_trait]
pub trait RemoteRegistry: Send + Sync {
    /// HEAD-equivalent: resolves `reference` (tag or digest) to the
    /// manifest digest the remote currently serves, without downloading
    /// the body.
    async fn head_manifest_digest(&self, repo: &str, reference: &str) -> Result<Digest, CoreError>;

    /// Downloads and returns the manifest body, its digest (the response's
    /// `Docker-Content-Digest`, falling back to a content hash), and its
    /// content type.
    async fn get_manifest(&self, repo: &str, reference: &str) -> Result<(Bytes, Digest, String), CoreError>;

    async fn get_blob_stream(
        &self,
        repo: &str,
        digest: &Digest,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, CoreError>;
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

pub struct HttpRemoteRegistry {
    client: Client,
    config: RemoteConfig,
    cached_token: RwLock<Option<String>>,
}

impl HttpRemoteRegistry {
    pub fn new(config: RemoteConfig) -> Self {
        Self { client: Client::new(), config, cached_token: RwLock::new(None) }
    }

    fn manifest_url(&self, repo: &str, reference: &str) -> String {
        format!("{}/v2/{repo}/manifests/{reference}", self.config.base_url.trim_end_matches('/'))
    }

    fn blob_url(&self, repo: &str, digest: &Digest) -> String {
        format!("{}/v2/{repo}/blobs/{digest}", self.config.base_url.trim_end_matches('/'))
    }

    /// Issues `request`, transparently handling a single 401 challenge by
    /// exchanging it for a bearer token and retrying once with a cached
    /// token applied up front on subsequent calls.
    async fn send_authenticated(
        &self,
        build: impl Fn(&Client) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, CoreError> {
        if let Some(token) = self.cached_token.read().await.clone() {
            let response = build(&self.client)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| CoreError::RemoteFailure(e.into()))?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
        }

        let probe = build(&self.client).send().await.map_err(|e| CoreError::RemoteFailure(e.into()))?;
        if probe.status() != StatusCode::UNAUTHORIZED {
            return Ok(probe);
        }

        let challenge = probe
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| {
                CoreError::RemoteFailure(anyhow::anyhow!("remote returned 401 without a Bearer challenge"))
            })?;

        let token = self.fetch_token(&challenge).await?;
        *self.cached_token.write().await = Some(token.clone());

        build(&self.client)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| CoreError::RemoteFailure(e.into()))
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, CoreError> {
        let mut request = self.client.get(&challenge.realm);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service)]);
        }
        if let Some(scope) = &challenge.scope {
            request = request.query(&[("scope", scope)]);
        }
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(|e| CoreError::RemoteFailure(e.into()))?;
        if !response.status().is_success() {
            return Err(CoreError::RemoteFailure(anyhow::anyhow!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| CoreError::RemoteFailure(e.into()))?;
        Ok(parsed.token)
    }
}

fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in rest.split(',') {
        let part = part.trim();
        let (key, value) = part.split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge { realm: realm?, service, scope })
}

#[async_trait]
impl RemoteRegistry for HttpRemoteRegistry {
    async fn head_manifest_digest(&self, repo: &str, reference: &str) -> Result<Digest, CoreError> {
        let url = self.manifest_url(repo, reference);
        let response = self
            .send_authenticated(|client| client.head(&url))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(CoreError::ManifestUnknown(reference.to_string()));
        }
        if !response.status().is_success() {
            return Err(CoreError::RemoteFailure(anyhow::anyhow!(
                "remote HEAD {url} returned {}",
                response.status()
            )));
        }
        digest_content_header(&response)
    }

    async fn get_manifest(&self, repo: &str, reference: &str) -> Result<(Bytes, Digest, String), CoreError> {
        let url = self.manifest_url(repo, reference);
        let response = self
            .send_authenticated(|client| client.get(&url))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(CoreError::ManifestUnknown(reference.to_string()));
        }
        if !response.status().is_success() {
            return Err(CoreError::RemoteFailure(anyhow::anyhow!(
                "remote GET {url} returned {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/vnd.oci.image.manifest.v1+json")
            .to_string();
        let header_digest = digest_content_header(&response).ok();
        let bytes = response.bytes().await.map_err(|e| CoreError::RemoteFailure(e.into()))?;
        let digest = match header_digest {
            Some(d) => d,
            None => crate::core::digest::hash_bytes(&bytes),
        };
        Ok((bytes, digest, content_type))
    }

    async fn get_blob_stream(
        &self,
        repo: &str,
        digest: &Digest,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, CoreError> {
        let url = self.blob_url(repo, digest);
        let response = self
            .send_authenticated(|client| client.get(&url))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(CoreError::BlobUnknown(digest.to_string()));
        }
        if !response.status().is_success() {
            return Err(CoreError::RemoteFailure(anyhow::anyhow!(
                "remote GET {url} returned {}",
                response.status()
            )));
        }
        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(|e| std::io::Error::other(e)));
        Ok(Box::new(StreamReader::new(stream)))
    }
}

fn digest_content_header(response: &reqwest::Response) -> Result<Digest, CoreError> {
    let raw = response
        .headers()
        .get("Docker-Content-Digest")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CoreError::RemoteFailure(anyhow::anyhow!("remote response missing Docker-Content-Digest")))?;
    crate::core::digest::parse(raw)
}

/// Shared by multiple proxy-side single-flight groups.
pub type SharedRemote = Arc<dyn RemoteRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge_with_all_fields() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:library/alpine:pull""#;
        let challenge = parse_bearer_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.example.com"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:library/alpine:pull"));
    }

    #[test]
    fn rejects_non_bearer_challenge() {
        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
    }
}

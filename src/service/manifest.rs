use crate::core::manifeststore::{ReferenceKind, classify_reference};
use crate::core::name::validate_name;
use crate::error::{AppError, OciError};
use crate::service::{arm_fetch_deadline, fetch_deadline};
use crate::utils::repo_identifier::identifier_from_full_name;
use crate::utils::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use oci_spec::distribution::TagListBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MANIFEST_CONTENT_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Resolves `reference` against local storage, pulling it through the
/// configured upstream on a miss, same split as `service::blob::open_blob`.
async fn resolve_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
) -> Result<(bytes::Bytes, Option<bytes::Bytes>, crate::core::digest::Digest), AppError> {
    if let Some(proxy) = &state.proxy {
        let cancel = CancellationToken::new();
        // Dropped (client disconnect, or this function returning) cancels
        // `cancel`, unblocking the remote read `core::proxy` is selecting on.
        let _disconnect_guard = cancel.clone().drop_guard();
        let _deadline_guard = arm_fetch_deadline(
            cancel.clone(),
            fetch_deadline(None, state.config.proxy_min_throughput_bps),
        );
        return Ok(proxy.get_manifest(name, reference, &cancel).await?);
    }

    match classify_reference(reference)? {
        ReferenceKind::Digest(digest) => {
            let (body, signatures) = state.manifests.get_manifest(name, &digest).await?;
            Ok((body, signatures, digest))
        }
        ReferenceKind::Tag(tag) => {
            let digest = state.manifests.get_tag(name, &tag).await?;
            let (body, signatures) = state.manifests.get_manifest(name, &digest).await?;
            Ok((body, signatures, digest))
        }
    }
}

fn manifest_response(status: StatusCode, digest: &str, body: bytes::Bytes) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE)
        .header(header::CONTENT_LENGTH, body.len())
        .header("Docker-Content-Digest", digest)
        .body(Body::from(body))
        .unwrap()
}

/// GET /v2/<name>/manifests/<reference>
pub async fn get_manifest_handler(
    State(state): State<Arc<AppState>>,
    Path((name, reference)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    let (body, _signatures, digest) = resolve_manifest(&state, &name, &reference).await?;

    Ok(manifest_response(StatusCode::OK, &digest.to_string(), body))
}

/// HEAD /v2/<name>/manifests/<reference>
pub async fn head_manifest_handler(
    State(state): State<Arc<AppState>>,
    Path((name, reference)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    let (body, _signatures, digest) = resolve_manifest(&state, &name, &reference).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE)
        .header(header::CONTENT_LENGTH, body.len())
        .header("Docker-Content-Digest", digest.to_string())
        .body(Body::empty())
        .unwrap())
}

/// PUT /v2/<name>/manifests/<reference>
pub async fn put_manifest_handler(
    State(state): State<Arc<AppState>>,
    Path((name, reference)): Path<(String, String)>,
    request: Request,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    state
        .repo_storage
        .ensure_repo_exists(&identifier_from_full_name(&name))
        .await?;

    let body_bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| OciError::ManifestInvalid(e.to_string()))?;

    if let ReferenceKind::Digest(expected) = classify_reference(&reference)? {
        let actual = crate::core::digest::hash_bytes(&body_bytes);
        if actual.to_string() != expected.to_string() {
            return Err(OciError::DigestInvalid(format!(
                "provided digest {expected} does not match content digest {actual}"
            ))
            .into());
        }
    }

    let installed = state.manifests.put_manifest(&name, body_bytes, None).await?;

    if let ReferenceKind::Tag(tag) = classify_reference(&reference)? {
        state.manifests.put_tag(&name, &tag, &installed).await?;
    }

    let location = format!("/v2/{name}/manifests/{installed}");
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            ("Docker-Content-Digest".parse().unwrap(), installed.to_string()),
        ],
        Body::empty(),
    )
        .into_response())
}

/// GET /v2/<name>/tags/list
pub async fn get_tag_list_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;

    let mut all_tags = state.manifests.list_tags(&name).await?;
    all_tags.sort();

    if let Some(last_tag) = params.get("last") {
        if let Some(last_index) = all_tags.iter().position(|t| t == last_tag) {
            all_tags = all_tags.split_off(last_index + 1);
        } else {
            all_tags.clear();
        }
    }

    let mut tags_to_return = all_tags;
    let mut next_link = None;

    if let Some(n_str) = params.get("n") {
        let n: usize = n_str.parse().map_err(|_| OciError::Unsupported)?;

        if n > 0 && tags_to_return.len() > n {
            let last_tag_for_this_page = tags_to_return[n - 1].clone();
            tags_to_return.truncate(n);

            next_link = Some(format!(
                "<{}/v2/{}/tags/list?n={}&last={}>; rel=\"next\"",
                state.config.registry_url, name, n, last_tag_for_this_page
            ));
        }
    }

    let tag_list = TagListBuilder::default()
        .name(name)
        .tags(tags_to_return)
        .build()
        .map_err(|_| OciError::Unsupported)?;

    let json_body = serde_json::to_string(&tag_list).map_err(|_| OciError::Unsupported)?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json_body))
        .unwrap();

    if let Some(link) = next_link {
        response.headers_mut().insert(header::LINK, link.parse().unwrap());
    }

    Ok(response)
}

/// DELETE /v2/<name>/manifests/<reference>
pub async fn delete_manifest_handler(
    State(state): State<Arc<AppState>>,
    Path((name, reference)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;

    match classify_reference(&reference)? {
        ReferenceKind::Tag(tag) => state.manifests.delete_tag(&name, &tag).await?,
        ReferenceKind::Digest(_) => return Err(OciError::Unsupported.into()),
    }

    Ok(StatusCode::ACCEPTED)
}

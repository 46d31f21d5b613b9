use crate::core::blobstore::UploadHandle;
use crate::core::digest;
use crate::core::name::validate_name;
use crate::error::{AppError, HeaderError, OciError};
use crate::service::{arm_fetch_deadline, fetch_deadline};
use crate::utils::repo_identifier::identifier_from_full_name;
use crate::utils::state::AppState;
use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::header::{HeaderMap, LOCATION, RANGE};
use axum::http::{Response, header};
use axum::response::IntoResponse;
use axum::{extract::Path, http::StatusCode};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// Opens a readable stream for `digest` under `repo`, pulling it through the
/// configured upstream on a local miss and failing with `BlobUnknown`
/// otherwise.
async fn open_blob(
    state: &AppState,
    repo: &str,
    digest: &crate::core::digest::Digest,
) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>, AppError> {
    if let Some(proxy) = &state.proxy {
        let cancel = CancellationToken::new();
        // Dropped (client disconnect, or this function returning) cancels
        // `cancel`, unblocking the remote read `core::proxy` is selecting on.
        let _disconnect_guard = cancel.clone().drop_guard();
        let size_hint = state.blobs.stat(digest).await.ok().map(|d| d.size);
        let _deadline_guard = arm_fetch_deadline(
            cancel.clone(),
            fetch_deadline(size_hint, state.config.proxy_min_throughput_bps),
        );
        Ok(proxy.open_blob(repo, digest, 0, &cancel).await?)
    } else {
        if !state.blobs.exists_in(repo, digest).await? {
            return Err(OciError::BlobUnknown(digest.to_string()).into());
        }
        Ok(state.blobs.open_read(digest, 0).await?)
    }
}

/// GET /v2/<name>/blobs/<digest>
pub async fn get_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, digest_str)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    let digest = digest::parse(&digest_str)?;

    let reader = open_blob(&state, &name, &digest).await?;
    let content_length = state.blobs.stat(&digest).await?.size;
    let body = Body::from_stream(tokio_util::io::ReaderStream::new(reader));

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, content_length)
        .header("Docker-Content-Digest", digest_str)
        .body(body)
        .unwrap())
}

/// HEAD /v2/<name>/blobs/<digest>
pub async fn head_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, digest_str)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    let digest = digest::parse(&digest_str)?;

    // A HEAD still has to pull the blob through if it is only known to the
    // upstream, since a subsequent GET must find it cached.
    let _ = open_blob(&state, &name, &digest).await?;
    let content_length = state.blobs.stat(&digest).await?.size;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, content_length)
        .header("Docker-Content-Digest", digest_str)
        .body(Body::empty())
        .unwrap())
}

/// POST /v2/<name>/blobs/uploads/
pub async fn post_blob_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    state
        .repo_storage
        .ensure_repo_exists(&identifier_from_full_name(&name))
        .await?;

    if let Some(digest_str) = params.get("digest") {
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                OciError::SizeInvalid(
                    "Content-Length header is required for monolithic upload".to_string(),
                )
            })?;
        if content_length == 0 {
            return Err(OciError::SizeInvalid("Content-Length cannot be zero".to_string()).into());
        }
        let digest = digest::parse(digest_str)?;

        let handle = state.blobs.initiate_upload(&name).await?;
        let reader = body_reader(request);
        if let Err(e) = state
            .blobs
            .append_part(&handle, reader, Some(content_length))
            .await
        {
            state.blobs.abort_upload(&handle).await.ok();
            return Err(e.into());
        }
        let installed = state
            .blobs
            .finalize_upload(&handle, &name, Some(&digest), Some(content_length))
            .await?;

        let location = format!("/v2/{name}/blobs/{installed}");
        Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header(LOCATION, location)
            .header("Docker-Content-Digest", installed.to_string())
            .body(Body::empty())
            .unwrap())
    } else {
        let handle = state.blobs.initiate_upload(&name).await?;
        let location = format!("/v2/{name}/blobs/uploads/{}", handle.id);
        Ok(Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(LOCATION, location)
            .header("Docker-Upload-UUID", handle.id)
            .body(Body::empty())
            .unwrap())
    }
}

/// PATCH /v2/<name>/blobs/uploads/<session_id>
pub async fn patch_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, session_id)): Path<(String, String)>,
    headers: HeaderMap,
    request: Request,
) -> Result<impl IntoResponse, AppError> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| {
            OciError::SizeInvalid("Valid Content-Length is required for PATCH requests".to_string())
        })?;

    let (start_offset, _) = parse_content_range(&headers)?;
    let handle = UploadHandle::existing(session_id.clone());
    let current_uploaded_bytes = state.blobs.resume_offset(&handle).await?;
    if start_offset != current_uploaded_bytes {
        return Err(HeaderError::RangeNotSatisfiable {
            session_id,
            name,
            current_size: current_uploaded_bytes,
        }
        .into());
    }

    let reader = body_reader(request);
    let new_total_size = state
        .blobs
        .append_part(&handle, reader, Some(content_length))
        .await?;

    let location = format!("/v2/{name}/blobs/uploads/{session_id}");
    let end_of_range = new_total_size.saturating_sub(1);

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(LOCATION, location)
        .header(RANGE, format!("0-{end_of_range}"))
        .header("Docker-Upload-UUID", &session_id)
        .body(Body::empty())
        .unwrap())
}

/// PUT /v2/<name>/blobs/uploads/<session_id>
pub async fn put_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, session_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<impl IntoResponse, AppError> {
    let digest_str = params.get("digest").ok_or_else(|| {
        OciError::DigestInvalid("digest query parameter is required to finalize upload".to_string())
    })?;
    let digest = digest::parse(digest_str)?;
    let handle = UploadHandle::existing(session_id);

    let reader = body_reader(request);
    if let Err(e) = state.blobs.append_part(&handle, reader, None).await {
        state.blobs.abort_upload(&handle).await.ok();
        return Err(e.into());
    }
    let installed = match state
        .blobs
        .finalize_upload(&handle, &name, Some(&digest), None)
        .await
    {
        Ok(d) => d,
        Err(e) => {
            state.blobs.abort_upload(&handle).await.ok();
            return Err(e.into());
        }
    };

    let location = format!("/v2/{name}/blobs/{installed}");
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(LOCATION, location)
        .header("Docker-Content-Digest", installed.to_string())
        .body(Body::empty())
        .unwrap())
}

/// GET /v2/<name>/blobs/uploads/<session_id>
pub async fn get_blob_status_handler(
    State(state): State<Arc<AppState>>,
    Path((name, session_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let handle = UploadHandle::existing(session_id.clone());
    let uploaded = state.blobs.resume_offset(&handle).await?;

    let location = format!("/v2/{name}/blobs/uploads/{session_id}");
    let end_of_range = uploaded.saturating_sub(1);

    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(LOCATION, location)
        .header(RANGE, format!("0-{end_of_range}"))
        .header("Docker-Upload-UUID", &session_id)
        .body(Body::empty())
        .unwrap())
}

/// DELETE /v2/<name>/blobs/<digest>
pub async fn delete_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, digest_str)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let digest = digest::parse(&digest_str)?;
    state.blobs.unlink(&name, &digest).await?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Body::empty())
        .unwrap())
}

/// Adapts an axum request body into the `AsyncRead` the blob store's
/// streaming hasher reads from, the same conversion
/// `core::remote::HttpRemoteRegistry` uses for response bodies.
fn body_reader(request: Request) -> impl tokio::io::AsyncRead + Send + Unpin {
    let stream = request
        .into_body()
        .into_data_stream()
        .map(|result| result.map_err(std::io::Error::other));
    StreamReader::new(stream)
}

fn parse_content_range(headers: &HeaderMap) -> Result<(u64, u64), AppError> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    if let Some(range_header) = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
    {
        let parts: Vec<&str> = range_header.split('-').collect();
        if parts.len() != 2 {
            return Err(HeaderError::ContentRangeInvalid("invalid format".to_string()).into());
        }

        let start = parts[0]
            .parse()
            .map_err(|_| HeaderError::ContentRangeInvalid("failed to parse start offset".to_string()))?;
        let end = parts[1]
            .parse()
            .map_err(|_| HeaderError::ContentRangeInvalid("failed to parse end offset".to_string()))?;
        if start > end {
            return Err(HeaderError::ContentRangeInvalid(
                "start offset cannot be greater than end offset".to_string(),
            )
            .into());
        }

        if let Some(content_length) = content_length {
            if content_length != (end - start + 1) {
                return Err(OciError::SizeInvalid(
                    "Content-Length does not match Content-Range".to_string(),
                )
                .into());
            }
        } else {
            return Err(OciError::SizeInvalid(
                "Content-Length header is required when Content-Range is present".to_string(),
            )
            .into());
        }

        return Ok((start, end));
    }
    if let Some(content_length) = content_length {
        if content_length > 0 {
            return Ok((0, content_length - 1));
        }
        return Err(OciError::SizeInvalid(
            "Content-Length must be greater than zero for a PATCH request without Content-Range"
                .to_string(),
        )
        .into());
    }
    Err(HeaderError::ContentRangeMissing.into())
}

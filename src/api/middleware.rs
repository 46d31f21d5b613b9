use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;

use crate::api::{AuthHeader, RepoIdentifier, extract_claims};
use crate::core::access::{AccessSet, authorize};
use crate::error::{AppError, OciError};
use crate::utils::jwt::Claims;
use crate::utils::repo_identifier::identifier_from_full_name;
use crate::utils::state::AppState;

const RESOURCE_REPOSITORY: &str = "repository";

/// Fills in a `Claims` request extension from whatever credential the
/// request carries. Never rejects by itself: an anonymous pull of a public
/// repository has to reach `authorize_repository_access` with no claims at
/// all, which is the layer that decides whether the resource allows it.
pub async fn populate_oci_claims(
    State(state): State<Arc<AppState>>,
    auth: Option<AuthHeader>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, AppError> {
    if let Ok(claims) = extract_claims(
        auth,
        &state.config.jwt_secret,
        state.user_storage.as_ref(),
        &state.config.registry_url,
    )
    .await
    {
        req.extensions_mut().insert(claims);
    }
    Ok(next.run(req).await)
}

/// Rejects any request that didn't carry a verified `Claims` extension.
/// Used for routes with no anonymous path, such as listing the caller's
/// own repositories.
pub async fn require_authentication(
    State(_state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, AppError> {
    if req.extensions().get::<Claims>().is_none() {
        return Err(OciError::Unauthorized {
            msg: "authentication required".to_string(),
            auth_url: None,
        }
        .into());
    }
    Ok(next.run(req).await)
}

/// Builds an `AccessSet` for the repository named by the request path from
/// its `Claims` extension (if any) and the catalog's visibility flag, then
/// calls `core::access::authorize` with the action implied by the HTTP
/// method. Stashes the parsed `RepoIdentifier` as a request extension for
/// downstream handlers such as `service::repo::change_visibility`.
#[tracing::instrument(skip_all)]
pub async fn authorize_repository_access(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, AppError> {
    let Some(full_name) = extract_repo_name(req.uri().path()) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let identifier = identifier_from_full_name(&full_name);

    let action = match *req.method() {
        Method::GET | Method::HEAD => "pull",
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE => "push",
        _ => return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
    };

    let claims = req.extensions().get::<Claims>().cloned();
    let is_owner = claims
        .as_ref()
        .is_some_and(|claims| claims.sub == identifier.namespace);

    if action == "push" && claims.is_none() {
        return Err(OciError::Unauthorized {
            msg: "authentication required to push".to_string(),
            auth_url: Some(state.config.registry_url.clone()),
        }
        .into());
    }

    let mut access = AccessSet::new();
    let is_public = state
        .repo_storage
        .query_repo_by_identifier(&identifier)
        .await
        .map(|repo| repo.is_public)
        .unwrap_or(false);
    if is_public {
        access.grant(RESOURCE_REPOSITORY, &full_name, "pull");
    }
    if is_owner {
        access.grant(RESOURCE_REPOSITORY, &full_name, "pull");
        access.grant(RESOURCE_REPOSITORY, &full_name, "push");
    }

    authorize(&access, RESOURCE_REPOSITORY, &full_name, action).map_err(|_| {
        AppError::Oci(OciError::Forbidden(format!(
            "not allowed to {action} `{full_name}`"
        )))
    })?;

    req.extensions_mut().insert(RepoIdentifier(identifier));
    Ok(next.run(req).await)
}

fn extract_repo_name(path: &str) -> Option<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        // tail: /{name}/manifests/{reference}
        [name @ .., "manifests", _reference] if !name.is_empty() => Some(name.join("/")),
        // tail: /{name}/blobs/{digest}
        [name @ .., "blobs", digest] if !name.is_empty() && *digest != "uploads" => {
            Some(name.join("/"))
        }
        // tail: /{name}/blobs/uploads/
        [name @ .., "blobs", "uploads"] if !name.is_empty() => Some(name.join("/")),
        // tail: /{name}/blobs/uploads/{session_id}
        [name @ .., "blobs", "uploads", _] if !name.is_empty() => Some(name.join("/")),
        // tail: /{name}/tags/list
        [name @ .., "tags", "list"] if !name.is_empty() => Some(name.join("/")),
        // tail: /{name}/referrers/{digest}
        [name @ .., "referrers", _digest] if !name.is_empty() => Some(name.join("/")),
        // tail: /{name}/visibility
        [name @ .., "visibility"] if !name.is_empty() => Some(name.join("/")),
        _ => None,
    }
}

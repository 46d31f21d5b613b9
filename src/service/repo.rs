use crate::api::RepoIdentifier;
use crate::error::AppError;
use crate::utils::jwt::Claims;
use crate::utils::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeVisReq {
    visibility: String,
}

pub async fn change_visibility(
    State(state): State<Arc<AppState>>,
    Extension(identifier): Extension<RepoIdentifier>,
    Json(body): Json<ChangeVisReq>,
) -> Result<impl IntoResponse, AppError> {
    Ok(match body.visibility.as_str() {
        "public" | "private" => {
            state
                .repo_storage
                .change_visibility(&identifier.0, body.visibility == "public")
                .await?;
            StatusCode::OK.into_response()
        }
        _ => (
            StatusCode::BAD_REQUEST,
            "`visibility` must be private or public",
        )
            .into_response(),
    })
}

/// Repositories visible to the caller: every public repository plus
/// whatever the caller's own namespace holds, regardless of visibility.
pub async fn list_visible_repos(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, AppError> {
    let repos = state.repo_storage.query_all_visible_repos(&claims.sub).await?;
    Ok(Json(
        repos
            .into_iter()
            .map(|repo| serde_json::json!({
                "namespace": repo.namespace,
                "name": repo.name,
                "is_public": repo.is_public,
            }))
            .collect::<Vec<_>>(),
    ))
}

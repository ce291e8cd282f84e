//! Public storage API: presigned upload/download, listing, and deletion
//! inside a project's logical buckets.

use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strata_core::objects::ObjectInfo;

use crate::error::ApiError;
use crate::extract::ApiKeyContext;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/v1/storage/signed-upload", post(signed_upload))
        .route("/v1/storage/signed-download", get(signed_download))
        .route("/v1/storage/list", get(list_objects))
        .route("/v1/storage/object", delete(delete_object))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUploadRequest {
    pub bucket: String,
    pub path: String,
    pub content_type: String,
    #[serde(default)]
    pub max_size: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUploadResponse {
    pub object_key: String,
    pub upload_url: String,
    pub expires_in: u64,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn signed_upload(
    key: ApiKeyContext,
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<SignedUploadRequest>,
) -> Result<Json<SignedUploadResponse>, ApiError> {
    let grant = state
        .broker
        .presign_upload(
            key.0.project_id,
            &body.bucket,
            &body.path,
            &body.content_type,
            body.max_size,
        )
        .await?;
    Ok(Json(SignedUploadResponse {
        object_key: grant.object_key,
        upload_url: grant.url,
        expires_in: grant.expires_in,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedDownloadQuery {
    pub bucket: String,
    pub object_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedDownloadResponse {
    pub download_url: String,
    pub expires_in: u64,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn signed_download(
    key: ApiKeyContext,
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<SignedDownloadQuery>,
) -> Result<Json<SignedDownloadResponse>, ApiError> {
    let grant = state
        .broker
        .presign_download(key.0.project_id, &query.bucket, &query.object_key)
        .await?;
    Ok(Json(SignedDownloadResponse {
        download_url: grant.url,
        expires_in: grant.expires_in,
    }))
}

#[derive(Deserialize)]
pub struct ListQueryParams {
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct ListResponse {
    pub objects: Vec<ObjectInfo>,
}

/// Listing is secret-key only.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_objects(
    key: ApiKeyContext,
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ListQueryParams>,
) -> Result<Json<ListResponse>, ApiError> {
    key.require_secret()?;
    let objects = state
        .broker
        .list(
            key.0.project_id,
            &query.bucket,
            query.prefix.as_deref(),
            query.limit.unwrap_or(1000),
        )
        .await?;
    Ok(Json(ListResponse { objects }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteObjectQuery {
    pub bucket: String,
    pub object_key: String,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn delete_object(
    key: ApiKeyContext,
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<DeleteObjectQuery>,
) -> Result<StatusCode, ApiError> {
    key.require_secret()?;
    state
        .broker
        .delete(key.0.project_id, &query.bucket, &query.object_key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

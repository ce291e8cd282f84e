//! Public data API: key-scoped CRUD over a project's tenant database.

use axum::extract::{Path, RawQuery};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use strata_core::crud::TableSchema;

use crate::error::ApiError;
use crate::extract::ApiKeyContext;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/v1/db/tables", get(list_tables))
        .route(
            "/v1/db/{table}",
            get(select_rows)
                .post(insert_rows)
                .patch(update_rows)
                .delete(delete_rows),
        )
}

/// Decode the raw query string preserving duplicate and dynamic keys.
/// `Query<T>` cannot deserialize the `<op>.<column>` grammar, so the
/// splitting stays manual; the percent-decoding does not.
fn query_pairs(raw: Option<String>) -> Vec<(String, String)> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    url_decode_pairs(&raw)
}

fn url_decode_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            (decode_component(k), decode_component(v))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    // '+' means space in query strings; an encoded '+' arrives as %2B and
    // is untouched by the replace.
    let plus_as_space = raw.replace('+', " ");
    urlencoding::decode(&plus_as_space)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(plus_as_space)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowsResponse {
    pub rows: Vec<Value>,
    pub row_count: usize,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_tables(
    key: ApiKeyContext,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<TableSchema>>, ApiError> {
    let tables = state.crud.list_tables(key.0.project_id).await?;
    Ok(Json(tables))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn select_rows(
    key: ApiKeyContext,
    Extension(state): Extension<Arc<AppState>>,
    Path(table): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Json<RowsResponse>, ApiError> {
    let pairs = query_pairs(raw);
    let result = state.crud.select(key.0.project_id, &table, &pairs).await?;
    Ok(Json(RowsResponse {
        rows: result.rows,
        row_count: result.row_count,
    }))
}

#[derive(Deserialize)]
pub struct InsertBody {
    pub rows: Vec<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub returning: bool,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn insert_rows(
    key: ApiKeyContext,
    Extension(state): Extension<Arc<AppState>>,
    Path(table): Path<String>,
    Json(body): Json<InsertBody>,
) -> Result<(StatusCode, Json<RowsResponse>), ApiError> {
    key.require_secret()?;
    let result = state
        .crud
        .insert(key.0.project_id, &table, &body.rows, body.returning)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RowsResponse {
            rows: result.rows,
            row_count: result.row_count,
        }),
    ))
}

#[derive(Deserialize)]
pub struct UpdateBody {
    pub values: serde_json::Map<String, Value>,
    #[serde(default)]
    pub returning: bool,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn update_rows(
    key: ApiKeyContext,
    Extension(state): Extension<Arc<AppState>>,
    Path(table): Path<String>,
    RawQuery(raw): RawQuery,
    Json(body): Json<UpdateBody>,
) -> Result<Json<RowsResponse>, ApiError> {
    key.require_secret()?;
    let pairs = query_pairs(raw);
    let result = state
        .crud
        .update(
            key.0.project_id,
            &table,
            &pairs,
            &body.values,
            body.returning,
        )
        .await?;
    Ok(Json(RowsResponse {
        rows: result.rows,
        row_count: result.row_count,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub deleted_count: usize,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn delete_rows(
    key: ApiKeyContext,
    Extension(state): Extension<Arc<AppState>>,
    Path(table): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Json<DeleteResponse>, ApiError> {
    key.require_secret()?;
    let pairs = query_pairs(raw);
    let deleted = state.crud.delete(key.0.project_id, &table, &pairs).await?;
    Ok(Json(DeleteResponse {
        deleted_count: deleted,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_keep_dynamic_keys() {
        let pairs = url_decode_pairs("eq.name=John&order=id.asc&limit=10");
        assert_eq!(
            pairs,
            vec![
                ("eq.name".to_string(), "John".to_string()),
                ("order".to_string(), "id.asc".to_string()),
                ("limit".to_string(), "10".to_string()),
            ]
        );
    }

    #[test]
    fn percent_and_plus_decoding() {
        let pairs = url_decode_pairs("like.email=%25%40x&eq.name=John+Doe");
        assert_eq!(pairs[0].1, "%@x");
        assert_eq!(pairs[1].1, "John Doe");
    }
}

//! Safe CRUD compiler and executor for the public data API.
//!
//! A REST query string is parsed into a closed filter grammar, validated
//! against the cached tenant schema, compiled to a parameterized
//! statement, and executed through the app-privilege pool. No raw client
//! SQL ever reaches a tenant database.

pub mod compile;
pub mod filter;
pub mod schema;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, Column, Row};
use std::sync::Arc;

use crate::config::SettingsHandle;
use crate::models::{DbPrincipal, ProjectId};
use crate::tenant::TenantRouter;
use crate::{Error, Result};

pub use compile::{ParamValue, Statement};
pub use filter::{CrudQuery, Filter, FilterOp, Select};
pub use schema::{ColumnSchema, SchemaCache, TableSchema};

const MAX_INSERT_ROWS: usize = 1000;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RowSet {
    pub rows: Vec<Value>,
    pub row_count: usize,
}

pub struct CrudExecutor {
    router: Arc<TenantRouter>,
    schema: Arc<SchemaCache>,
    settings: SettingsHandle,
}

impl CrudExecutor {
    pub fn new(router: Arc<TenantRouter>, schema: Arc<SchemaCache>, settings: SettingsHandle) -> Self {
        Self {
            router,
            schema,
            settings,
        }
    }

    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.schema
    }

    /// Tables and columns visible to the project.
    pub async fn list_tables(&self, project_id: ProjectId) -> Result<Vec<TableSchema>> {
        self.schema.tables(project_id).await
    }

    pub async fn select(
        &self,
        project_id: ProjectId,
        table: &str,
        pairs: &[(String, String)],
    ) -> Result<RowSet> {
        compile::ensure_table_name(table)?;
        let query = filter::parse_query(pairs, self.settings.snapshot().sql_max_rows)?;
        let table_schema = self.schema.table(project_id, table).await?;
        let stmt = compile::build_select(&table_schema, &query)?;

        let pool = self.router.pool(project_id, DbPrincipal::App).await?;
        let rows = sqlx::query_with(&stmt.sql, bind_params(&stmt.params)?)
            .fetch_all(&pool)
            .await
            .map_err(crud_db_error)?;
        let rows: Vec<Value> = rows.iter().map(row_to_json).collect::<Result<_>>()?;
        Ok(RowSet {
            row_count: rows.len(),
            rows,
        })
    }

    /// Insert 1..=1000 rows, one statement per row through the app pool.
    /// Per-row column validation; best-effort across rows is the contract,
    /// but the first failure stops the batch and reports the row index.
    pub async fn insert(
        &self,
        project_id: ProjectId,
        table: &str,
        rows: &[serde_json::Map<String, Value>],
        returning: bool,
    ) -> Result<RowSet> {
        compile::ensure_table_name(table)?;
        if rows.is_empty() {
            return Err(Error::BadRequest("no rows to insert".to_string()));
        }
        if rows.len() > MAX_INSERT_ROWS {
            return Err(Error::BadRequest(format!(
                "at most {MAX_INSERT_ROWS} rows per insert"
            )));
        }
        let table_schema = self.schema.table(project_id, table).await?;
        let pool = self.router.pool(project_id, DbPrincipal::App).await?;

        let mut out = Vec::new();
        let mut inserted = 0usize;
        for (index, row) in rows.iter().enumerate() {
            let stmt = compile::build_insert(&table_schema, row, returning)
                .map_err(|e| at_row(index, e))?;
            if returning {
                let row = sqlx::query_with(&stmt.sql, bind_params(&stmt.params)?)
                    .fetch_one(&pool)
                    .await
                    .map_err(|e| at_row(index, crud_db_error(e)))?;
                out.push(row_to_json(&row)?);
                inserted += 1;
            } else {
                sqlx::query_with(&stmt.sql, bind_params(&stmt.params)?)
                    .execute(&pool)
                    .await
                    .map_err(|e| at_row(index, crud_db_error(e)))?;
                inserted += 1;
            }
        }
        Ok(RowSet {
            row_count: inserted,
            rows: out,
        })
    }

    /// Update rows matching the filters. At least one filter is required;
    /// the compiler refuses unscoped mutations before any SQL is emitted.
    pub async fn update(
        &self,
        project_id: ProjectId,
        table: &str,
        pairs: &[(String, String)],
        values: &serde_json::Map<String, Value>,
        returning: bool,
    ) -> Result<RowSet> {
        compile::ensure_table_name(table)?;
        let query = filter::parse_query(pairs, self.settings.snapshot().sql_max_rows)?;
        let table_schema = self.schema.table(project_id, table).await?;
        let stmt = compile::build_update(&table_schema, values, &query.filters, returning)?;

        let pool = self.router.pool(project_id, DbPrincipal::App).await?;
        if returning {
            let rows = sqlx::query_with(&stmt.sql, bind_params(&stmt.params)?)
                .fetch_all(&pool)
                .await
                .map_err(crud_db_error)?;
            let rows: Vec<Value> = rows.iter().map(row_to_json).collect::<Result<_>>()?;
            Ok(RowSet {
                row_count: rows.len(),
                rows,
            })
        } else {
            let res = sqlx::query_with(&stmt.sql, bind_params(&stmt.params)?)
                .execute(&pool)
                .await
                .map_err(crud_db_error)?;
            Ok(RowSet {
                row_count: res.rows_affected() as usize,
                rows: Vec::new(),
            })
        }
    }

    /// Delete rows matching the filters; same ≥1-filter rule as update.
    pub async fn delete(
        &self,
        project_id: ProjectId,
        table: &str,
        pairs: &[(String, String)],
    ) -> Result<usize> {
        compile::ensure_table_name(table)?;
        let query = filter::parse_query(pairs, self.settings.snapshot().sql_max_rows)?;
        let table_schema = self.schema.table(project_id, table).await?;
        let stmt = compile::build_delete(&table_schema, &query.filters)?;

        let pool = self.router.pool(project_id, DbPrincipal::App).await?;
        let res = sqlx::query_with(&stmt.sql, bind_params(&stmt.params)?)
            .execute(&pool)
            .await
            .map_err(crud_db_error)?;
        Ok(res.rows_affected() as usize)
    }
}

fn at_row(index: usize, e: Error) -> Error {
    match e {
        Error::BadRequest(msg) => Error::BadRequest(format!("row {index}: {msg}")),
        Error::Schema(msg) => Error::Schema(format!("row {index}: {msg}")),
        other => other,
    }
}

/// Tenant database errors surface as client errors carrying the backend
/// message (the caller wrote the schema; the message is theirs to see).
fn crud_db_error(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(db) => Error::BadRequest(db.message().to_string()),
        _ => Error::backend("tenant query", e),
    }
}

pub(crate) fn bind_params(params: &[ParamValue]) -> Result<PgArguments> {
    let mut args = PgArguments::default();
    for p in params {
        let res = match p {
            ParamValue::Null => args.add(Option::<String>::None),
            ParamValue::Bool(v) => args.add(*v),
            ParamValue::I64(v) => args.add(*v),
            ParamValue::F64(v) => args.add(*v),
            ParamValue::Uuid(v) => args.add(*v),
            ParamValue::Timestamp(v) => args.add(*v),
            ParamValue::Text(v) => args.add(v.clone()),
            ParamValue::Json(v) => args.add(sqlx::types::Json(v.clone())),
        };
        res.map_err(|e| Error::BackendMessage(format!("bind parameter: {e}")))?;
    }
    Ok(args)
}

/// Decode an arbitrary tenant row into a JSON object, probing common
/// Postgres types in order.
pub(crate) fn row_to_json(row: &PgRow) -> Result<Value> {
    let mut out = serde_json::Map::with_capacity(row.columns().len());
    for col in row.columns() {
        let name = col.name();

        if let Ok(v) = row.try_get::<Option<i64>, _>(name) {
            if let Some(v) = v {
                out.insert(name.to_string(), Value::from(v));
                continue;
            }
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(name) {
            if let Some(v) = v {
                out.insert(name.to_string(), Value::from(v));
                continue;
            }
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(name) {
            if let Some(v) = v {
                out.insert(name.to_string(), Value::from(v));
                continue;
            }
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(name) {
            if let Some(v) = v {
                out.insert(name.to_string(), Value::from(v as f64));
                continue;
            }
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(name) {
            if let Some(v) = v {
                out.insert(name.to_string(), Value::Bool(v));
                continue;
            }
        }
        if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(name) {
            if let Some(v) = v {
                out.insert(name.to_string(), Value::String(v.to_string()));
                continue;
            }
        }
        if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(name) {
            if let Some(v) = v {
                out.insert(name.to_string(), Value::String(v.to_rfc3339()));
                continue;
            }
        }
        if let Ok(v) = row.try_get::<Option<Value>, _>(name) {
            if let Some(v) = v {
                out.insert(name.to_string(), v);
                continue;
            }
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(name) {
            if let Some(v) = v {
                out.insert(name.to_string(), Value::String(v));
                continue;
            }
        }

        out.insert(name.to_string(), Value::Null);
    }
    Ok(Value::Object(out))
}

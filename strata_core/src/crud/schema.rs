use dashmap::DashMap;
use sqlx::Row;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::{DbPrincipal, ProjectId};
use crate::tenant::TenantRouter;
use crate::{Error, Result};

const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

struct CachedSchema {
    fetched_at: Instant,
    tables: BTreeMap<String, TableSchema>,
}

/// Per-project table/column cache fed from `information_schema` through
/// the app-privilege pool. Entries expire after 60 seconds; a lookup miss
/// refreshes the whole project. Racing refreshes recompute redundantly,
/// which is safe.
pub struct SchemaCache {
    router: Arc<TenantRouter>,
    cache: DashMap<ProjectId, Arc<CachedSchema>>,
}

impl SchemaCache {
    pub fn new(router: Arc<TenantRouter>) -> Self {
        Self {
            router,
            cache: DashMap::new(),
        }
    }

    /// All tables visible to the project, refreshing on expiry.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tables(&self, project_id: ProjectId) -> Result<Vec<TableSchema>> {
        let schema = self.fresh(project_id, false).await?;
        Ok(schema.tables.values().cloned().collect())
    }

    /// Schema for one table. A miss forces one refresh before failing.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn table(&self, project_id: ProjectId, table: &str) -> Result<TableSchema> {
        let schema = self.fresh(project_id, false).await?;
        if let Some(t) = schema.tables.get(table) {
            return Ok(t.clone());
        }
        let schema = self.fresh(project_id, true).await?;
        schema
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| Error::Schema(format!("unknown table '{table}'")))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn invalidate(&self, project_id: ProjectId) {
        self.cache.remove(&project_id);
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn fresh(&self, project_id: ProjectId, force: bool) -> Result<Arc<CachedSchema>> {
        if !force {
            if let Some(entry) = self.cache.get(&project_id) {
                if entry.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(entry.clone());
                }
            }
        }
        let tables = self.fetch(project_id).await?;
        let schema = Arc::new(CachedSchema {
            fetched_at: Instant::now(),
            tables,
        });
        self.cache.insert(project_id, schema.clone());
        Ok(schema)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch(&self, project_id: ProjectId) -> Result<BTreeMap<String, TableSchema>> {
        let pool = self.router.pool(project_id, DbPrincipal::App).await?;
        let rows = sqlx::query(
            r#"
            SELECT table_name, column_name, data_type, is_nullable
            FROM information_schema.columns
            WHERE table_schema = 'public'
            ORDER BY table_name, ordinal_position
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| Error::backend("fetch tenant schema", e))?;

        let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();
        for row in rows {
            let table: String = row
                .try_get("table_name")
                .map_err(|e| Error::backend("table_name", e))?;
            let column = ColumnSchema {
                name: row
                    .try_get("column_name")
                    .map_err(|e| Error::backend("column_name", e))?,
                data_type: row
                    .try_get("data_type")
                    .map_err(|e| Error::backend("data_type", e))?,
                is_nullable: row
                    .try_get::<String, _>("is_nullable")
                    .map_err(|e| Error::backend("is_nullable", e))?
                    == "YES",
            };
            tables
                .entry(table.clone())
                .or_insert_with(|| TableSchema {
                    name: table,
                    columns: Vec::new(),
                })
                .columns
                .push(column);
        }
        Ok(tables)
    }
}

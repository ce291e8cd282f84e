//! Admin SQL executor: single-statement gate, privileged-operation
//! denylist, row-cap injection, and per-statement timeout, running on the
//! owner pool.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::config::SettingsHandle;
use crate::crud::schema::SchemaCache;
use crate::models::{DbPrincipal, ProjectId};
use crate::tenant::TenantRouter;
use crate::{Error, Result};

/// Substrings (normalized to uppercase, collapsed whitespace) that no
/// admin statement may contain.
const DENYLIST: [&str; 6] = [
    "DO $$",
    "PG_SLEEP(",
    "CREATE EXTENSION",
    "DROP DATABASE",
    "DROP ROLE",
    "ALTER SYSTEM",
];

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlResult {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

pub struct SqlExecutor {
    router: Arc<TenantRouter>,
    schema: Arc<SchemaCache>,
    settings: SettingsHandle,
}

impl SqlExecutor {
    pub fn new(router: Arc<TenantRouter>, schema: Arc<SchemaCache>, settings: SettingsHandle) -> Self {
        Self {
            router,
            schema,
            settings,
        }
    }

    /// Validate and run one admin statement against the project's owner
    /// pool. Database errors surface as client errors with the server
    /// message.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn execute(&self, project_id: ProjectId, sql: &str) -> Result<SqlResult> {
        let settings = self.settings.snapshot();
        let statement = single_statement(sql)?;
        check_denylist(&statement)?;
        let statement = inject_limit(&statement, settings.sql_max_rows);

        let pool = self.router.pool(project_id, DbPrincipal::Owner).await?;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| Error::backend("acquire owner connection", e))?;

        // The timeout must live on the same session as the statement.
        sqlx::query(&format!(
            "SET statement_timeout = {}",
            settings.sql_statement_timeout_ms
        ))
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::backend("set statement_timeout", e))?;

        let started = Instant::now();
        let rows = sqlx::query(&statement)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) => Error::BadRequest(db.message().to_string()),
                _ => Error::backend("admin sql", e),
            })?;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        // DDL through this path changes the tenant schema; drop the cache
        // so the next CRUD call sees it.
        self.schema.invalidate(project_id);

        let columns = rows
            .first()
            .map(|row| {
                use sqlx::{Column, Row};
                row.columns().iter().map(|c| c.name().to_string()).collect()
            })
            .unwrap_or_default();
        let rows: Vec<Value> = rows
            .iter()
            .map(crate::crud::row_to_json)
            .collect::<Result<_>>()?;

        Ok(SqlResult {
            columns,
            row_count: rows.len(),
            rows,
            execution_time_ms,
        })
    }
}

/// Reject multi-statement input.
///
/// The split is a plain textual `;` scan: a `;` inside a string literal is
/// miscounted as a statement boundary and rejected. That false positive is
/// accepted as the conservative behavior.
pub fn single_statement(sql: &str) -> Result<String> {
    let parts: Vec<&str> = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    match parts.len() {
        0 => Err(Error::BadRequest("empty sql".to_string())),
        1 => Ok(parts[0].to_string()),
        n => Err(Error::BadRequest(format!(
            "expected a single statement, got {n}"
        ))),
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Deny privileged operations before anything reaches the backend.
pub fn check_denylist(sql: &str) -> Result<()> {
    let normalized = normalize(sql);
    for pattern in DENYLIST {
        if normalized.contains(pattern) {
            return Err(Error::Denied(format!(
                "statement contains forbidden operation '{}'",
                pattern.trim_end_matches('(')
            )));
        }
    }
    // COPY ... PROGRAM runs a shell command server-side.
    if normalized.contains("COPY") && normalized.contains("PROGRAM") {
        return Err(Error::Denied(
            "statement contains forbidden operation 'COPY PROGRAM'".to_string(),
        ));
    }
    Ok(())
}

/// Append `LIMIT <max_rows>` to SELECT/WITH statements that lack one.
pub fn inject_limit(sql: &str, max_rows: u32) -> String {
    let normalized = normalize(sql);
    let is_query = normalized.starts_with("SELECT") || normalized.starts_with("WITH");
    if is_query && !normalized.contains(" LIMIT ") && !normalized.ends_with(" LIMIT") {
        format!("{} LIMIT {}", sql.trim_end(), max_rows)
    } else {
        sql.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_statement_accepts_trailing_semicolon() {
        assert_eq!(single_statement("SELECT 1;").unwrap(), "SELECT 1");
        assert_eq!(single_statement("  SELECT 1  ").unwrap(), "SELECT 1");
    }

    #[test]
    fn multi_statement_is_rejected() {
        assert!(single_statement("SELECT 1; SELECT 2").is_err());
        assert!(single_statement("").is_err());
        // Known false positive: a ';' inside a literal counts as a boundary.
        assert!(single_statement("SELECT 'a;b'").is_err());
    }

    #[test]
    fn denylist_blocks_privileged_statements() {
        for sql in [
            "DROP DATABASE strata",
            "drop   database strata",
            "DROP ROLE admin",
            "ALTER SYSTEM SET shared_buffers = '1GB'",
            "CREATE EXTENSION pg_stat_statements",
            "SELECT pg_sleep(10)",
            "DO $$ BEGIN NULL; END $$",
            "COPY users TO PROGRAM 'cat'",
        ] {
            assert!(
                matches!(check_denylist(sql), Err(Error::Denied(_))),
                "expected denial for: {sql}"
            );
        }
    }

    #[test]
    fn denylist_allows_regular_statements() {
        for sql in [
            "SELECT * FROM users",
            "CREATE TABLE t (id SERIAL PRIMARY KEY)",
            "UPDATE users SET name = 'x' WHERE id = 1",
            "DELETE FROM users WHERE id = 2",
            "ALTER TABLE users ADD COLUMN age INT",
        ] {
            assert!(check_denylist(sql).is_ok(), "unexpected denial for: {sql}");
        }
    }

    #[test]
    fn limit_injection_on_bare_selects() {
        assert_eq!(
            inject_limit("SELECT * FROM users", 1000),
            "SELECT * FROM users LIMIT 1000"
        );
        assert_eq!(
            inject_limit("WITH x AS (SELECT 1) SELECT * FROM x", 50),
            "WITH x AS (SELECT 1) SELECT * FROM x LIMIT 50"
        );
    }

    #[test]
    fn limit_injection_skips_existing_limit_and_non_queries() {
        assert_eq!(
            inject_limit("SELECT * FROM users LIMIT 5", 1000),
            "SELECT * FROM users LIMIT 5"
        );
        assert_eq!(
            inject_limit("INSERT INTO t VALUES (1)", 1000),
            "INSERT INTO t VALUES (1)"
        );
        assert_eq!(
            inject_limit("CREATE TABLE t (id INT)", 1000),
            "CREATE TABLE t (id INT)"
        );
    }
}

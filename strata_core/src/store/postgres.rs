use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::{DatabaseConfig, RuntimeSettings};
use crate::crypto::EncryptedPayload;
use crate::models::{
    ApiKey, ApiKeyType, AuditEntry, Backup, BackupFormat, BackupStatus, BackupType, CronJob,
    CronJobRun, CronJobType, DbPrincipal, FileMetadata, InviteKey, ListQuery, LogicalBucket,
    Project, ProjectCredential, ProjectId, RunStatus, SessionRecord, UserId, UserRecord, UserRole,
};
use crate::store::{BackupQuery, PlatformDb, PlatformStats};
use crate::{Error, Result};

const MIGRATION_0001: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Clone)]
pub struct PostgresPlatformDb {
    pool: PgPool,
}

impl PostgresPlatformDb {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.pool_max)
            .idle_timeout(cfg.idle_timeout)
            .acquire_timeout(cfg.connect_timeout)
            .connect(&cfg.url())
            .await
            .map_err(|e| Error::backend("connect platform db", e))?;
        Ok(Self { pool })
    }

    #[tracing::instrument(level = "debug", skip(pool))]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the platform schema.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION_0001)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("apply migrations", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn project_from_row(row: &PgRow) -> Result<Project> {
        Ok(Project {
            id: ProjectId(row.try_get::<Uuid, _>("id").map_err(|e| Error::backend("id", e))?),
            name: row.try_get("name").map_err(|e| Error::backend("name", e))?,
            slug: row.try_get("slug").map_err(|e| Error::backend("slug", e))?,
            description: row
                .try_get("description")
                .map_err(|e| Error::backend("description", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| Error::backend("updated_at", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn credential_from_row(row: &PgRow) -> Result<ProjectCredential> {
        let principal_str: String = row
            .try_get("principal")
            .map_err(|e| Error::backend("principal", e))?;
        let principal = DbPrincipal::parse_str(&principal_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid principal in db: {principal_str}"))
        })?;
        Ok(ProjectCredential {
            project_id: ProjectId(
                row.try_get::<Uuid, _>("project_id")
                    .map_err(|e| Error::backend("project_id", e))?,
            ),
            principal,
            payload: EncryptedPayload {
                ciphertext: row
                    .try_get("ciphertext")
                    .map_err(|e| Error::backend("ciphertext", e))?,
                iv: row.try_get("iv").map_err(|e| Error::backend("iv", e))?,
                auth_tag: row
                    .try_get("auth_tag")
                    .map_err(|e| Error::backend("auth_tag", e))?,
            },
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn api_key_from_row(row: &PgRow) -> Result<ApiKey> {
        let type_str: String = row
            .try_get("key_type")
            .map_err(|e| Error::backend("key_type", e))?;
        let key_type = ApiKeyType::parse_str(&type_str)
            .ok_or_else(|| Error::BackendMessage(format!("invalid key type in db: {type_str}")))?;
        Ok(ApiKey {
            id: row.try_get("id").map_err(|e| Error::backend("id", e))?,
            project_id: ProjectId(
                row.try_get::<Uuid, _>("project_id")
                    .map_err(|e| Error::backend("project_id", e))?,
            ),
            key_type,
            hash: row.try_get("hash").map_err(|e| Error::backend("hash", e))?,
            prefix: row
                .try_get("prefix")
                .map_err(|e| Error::backend("prefix", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
            expires_at: row
                .try_get("expires_at")
                .map_err(|e| Error::backend("expires_at", e))?,
            revoked_at: row
                .try_get("revoked_at")
                .map_err(|e| Error::backend("revoked_at", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn bucket_from_row(row: &PgRow) -> Result<LogicalBucket> {
        Ok(LogicalBucket {
            id: row.try_get("id").map_err(|e| Error::backend("id", e))?,
            project_id: ProjectId(
                row.try_get::<Uuid, _>("project_id")
                    .map_err(|e| Error::backend("project_id", e))?,
            ),
            name: row.try_get("name").map_err(|e| Error::backend("name", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn file_from_row(row: &PgRow) -> Result<FileMetadata> {
        Ok(FileMetadata {
            id: row.try_get("id").map_err(|e| Error::backend("id", e))?,
            project_id: ProjectId(
                row.try_get::<Uuid, _>("project_id")
                    .map_err(|e| Error::backend("project_id", e))?,
            ),
            logical_bucket: row
                .try_get("logical_bucket")
                .map_err(|e| Error::backend("logical_bucket", e))?,
            object_key: row
                .try_get("object_key")
                .map_err(|e| Error::backend("object_key", e))?,
            content_type: row
                .try_get("content_type")
                .map_err(|e| Error::backend("content_type", e))?,
            size_bytes: row
                .try_get("size_bytes")
                .map_err(|e| Error::backend("size_bytes", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn audit_from_row(row: &PgRow) -> Result<AuditEntry> {
        Ok(AuditEntry {
            id: row.try_get("id").map_err(|e| Error::backend("id", e))?,
            project_id: row
                .try_get::<Option<Uuid>, _>("project_id")
                .map_err(|e| Error::backend("project_id", e))?
                .map(ProjectId),
            user_id: row
                .try_get::<Option<Uuid>, _>("user_id")
                .map_err(|e| Error::backend("user_id", e))?
                .map(UserId),
            action: row
                .try_get("action")
                .map_err(|e| Error::backend("action", e))?,
            details: row
                .try_get("details")
                .map_err(|e| Error::backend("details", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn backup_from_row(row: &PgRow) -> Result<Backup> {
        let type_str: String = row
            .try_get("backup_type")
            .map_err(|e| Error::backend("backup_type", e))?;
        let backup_type = BackupType::parse_str(&type_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid backup type in db: {type_str}"))
        })?;
        let format_str: String = row
            .try_get("format")
            .map_err(|e| Error::backend("format", e))?;
        let format = BackupFormat::parse_str(&format_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid backup format in db: {format_str}"))
        })?;
        let status_str: String = row
            .try_get("status")
            .map_err(|e| Error::backend("status", e))?;
        let status = BackupStatus::parse_str(&status_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid backup status in db: {status_str}"))
        })?;
        Ok(Backup {
            id: row.try_get("id").map_err(|e| Error::backend("id", e))?,
            project_id: row
                .try_get::<Option<Uuid>, _>("project_id")
                .map_err(|e| Error::backend("project_id", e))?
                .map(ProjectId),
            backup_type,
            table_name: row
                .try_get("table_name")
                .map_err(|e| Error::backend("table_name", e))?,
            object_key: row
                .try_get("object_key")
                .map_err(|e| Error::backend("object_key", e))?,
            size_bytes: row
                .try_get("size_bytes")
                .map_err(|e| Error::backend("size_bytes", e))?,
            format,
            status,
            error_message: row
                .try_get("error_message")
                .map_err(|e| Error::backend("error_message", e))?,
            retention_days: row
                .try_get("retention_days")
                .map_err(|e| Error::backend("retention_days", e))?,
            expires_at: row
                .try_get("expires_at")
                .map_err(|e| Error::backend("expires_at", e))?,
            created_by: row
                .try_get::<Option<Uuid>, _>("created_by")
                .map_err(|e| Error::backend("created_by", e))?
                .map(UserId),
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
            completed_at: row
                .try_get("completed_at")
                .map_err(|e| Error::backend("completed_at", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn cron_job_from_row(row: &PgRow) -> Result<CronJob> {
        let type_str: String = row
            .try_get("job_type")
            .map_err(|e| Error::backend("job_type", e))?;
        let job_type = CronJobType::parse_str(&type_str)
            .ok_or_else(|| Error::BackendMessage(format!("invalid job type in db: {type_str}")))?;
        let encrypted_headers: Option<sqlx::types::Json<EncryptedPayload>> = row
            .try_get("encrypted_headers")
            .map_err(|e| Error::backend("encrypted_headers", e))?;
        let encrypted_body: Option<sqlx::types::Json<EncryptedPayload>> = row
            .try_get("encrypted_body")
            .map_err(|e| Error::backend("encrypted_body", e))?;
        Ok(CronJob {
            id: row.try_get("id").map_err(|e| Error::backend("id", e))?,
            project_id: row
                .try_get::<Option<Uuid>, _>("project_id")
                .map_err(|e| Error::backend("project_id", e))?
                .map(ProjectId),
            name: row.try_get("name").map_err(|e| Error::backend("name", e))?,
            job_type,
            cron_expr: row
                .try_get("cron_expr")
                .map_err(|e| Error::backend("cron_expr", e))?,
            timezone: row
                .try_get("timezone")
                .map_err(|e| Error::backend("timezone", e))?,
            http_url: row
                .try_get("http_url")
                .map_err(|e| Error::backend("http_url", e))?,
            http_method: row
                .try_get("http_method")
                .map_err(|e| Error::backend("http_method", e))?,
            encrypted_headers: encrypted_headers.map(|j| j.0),
            encrypted_body: encrypted_body.map(|j| j.0),
            platform_action: row
                .try_get("platform_action")
                .map_err(|e| Error::backend("platform_action", e))?,
            platform_config: row
                .try_get("platform_config")
                .map_err(|e| Error::backend("platform_config", e))?,
            enabled: row
                .try_get("enabled")
                .map_err(|e| Error::backend("enabled", e))?,
            timeout_ms: row
                .try_get("timeout_ms")
                .map_err(|e| Error::backend("timeout_ms", e))?,
            retries: row
                .try_get("retries")
                .map_err(|e| Error::backend("retries", e))?,
            retry_backoff_ms: row
                .try_get("retry_backoff_ms")
                .map_err(|e| Error::backend("retry_backoff_ms", e))?,
            last_run_at: row
                .try_get("last_run_at")
                .map_err(|e| Error::backend("last_run_at", e))?,
            next_run_at: row
                .try_get("next_run_at")
                .map_err(|e| Error::backend("next_run_at", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| Error::backend("updated_at", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn cron_run_from_row(row: &PgRow) -> Result<CronJobRun> {
        let status_str: String = row
            .try_get("status")
            .map_err(|e| Error::backend("status", e))?;
        let status = RunStatus::parse_str(&status_str).ok_or_else(|| {
            Error::BackendMessage(format!("invalid run status in db: {status_str}"))
        })?;
        Ok(CronJobRun {
            id: row.try_get("id").map_err(|e| Error::backend("id", e))?,
            job_id: row
                .try_get("job_id")
                .map_err(|e| Error::backend("job_id", e))?,
            attempt_number: row
                .try_get("attempt_number")
                .map_err(|e| Error::backend("attempt_number", e))?,
            started_at: row
                .try_get("started_at")
                .map_err(|e| Error::backend("started_at", e))?,
            finished_at: row
                .try_get("finished_at")
                .map_err(|e| Error::backend("finished_at", e))?,
            duration_ms: row
                .try_get("duration_ms")
                .map_err(|e| Error::backend("duration_ms", e))?,
            status,
            http_status: row
                .try_get("http_status")
                .map_err(|e| Error::backend("http_status", e))?,
            error_text: row
                .try_get("error_text")
                .map_err(|e| Error::backend("error_text", e))?,
            log_preview: row
                .try_get("log_preview")
                .map_err(|e| Error::backend("log_preview", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn user_from_row(row: &PgRow) -> Result<UserRecord> {
        let role_str: String = row
            .try_get("role")
            .map_err(|e| Error::backend("role", e))?;
        let role = UserRole::parse_str(&role_str)
            .ok_or_else(|| Error::BackendMessage(format!("invalid user role in db: {role_str}")))?;
        Ok(UserRecord {
            user_id: UserId(
                row.try_get::<Uuid, _>("user_id")
                    .map_err(|e| Error::backend("user_id", e))?,
            ),
            email: row
                .try_get("email")
                .map_err(|e| Error::backend("email", e))?,
            display_name: row
                .try_get("display_name")
                .map_err(|e| Error::backend("display_name", e))?,
            role,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn invite_from_row(row: &PgRow) -> Result<InviteKey> {
        let role_str: String = row
            .try_get("role")
            .map_err(|e| Error::backend("role", e))?;
        let role = UserRole::parse_str(&role_str)
            .ok_or_else(|| Error::BackendMessage(format!("invalid invite role in db: {role_str}")))?;
        Ok(InviteKey {
            id: row.try_get("id").map_err(|e| Error::backend("id", e))?,
            token_hash: row
                .try_get("token_hash")
                .map_err(|e| Error::backend("token_hash", e))?,
            role,
            created_by: row
                .try_get::<Option<Uuid>, _>("created_by")
                .map_err(|e| Error::backend("created_by", e))?
                .map(UserId),
            expires_at: row
                .try_get("expires_at")
                .map_err(|e| Error::backend("expires_at", e))?,
            used_at: row
                .try_get("used_at")
                .map_err(|e| Error::backend("used_at", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
        })
    }

    #[tracing::instrument(level = "debug", skip(row))]
    fn session_from_row(row: &PgRow) -> Result<SessionRecord> {
        Ok(SessionRecord {
            token_hash: row
                .try_get("token_hash")
                .map_err(|e| Error::backend("token_hash", e))?,
            user_id: UserId(
                row.try_get::<Uuid, _>("user_id")
                    .map_err(|e| Error::backend("user_id", e))?,
            ),
            expires_at: row
                .try_get("expires_at")
                .map_err(|e| Error::backend("expires_at", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
        })
    }
}

#[async_trait]
impl PlatformDb for PostgresPlatformDb {
    #[tracing::instrument(level = "debug", skip(self, project))]
    async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, slug, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(project.id.0)
        .bind(&project.name)
        .bind(&project.slug)
        .bind(&project.description)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(format!("project slug '{}' already exists", project.slug))
            }
            _ => Error::backend("insert project", e),
        })?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get project", e))?;
        row.as_ref().map(Self::project_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get project by slug", e))?;
        row.as_ref().map(Self::project_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_projects(&self, query: ListQuery) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT * FROM projects ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list projects", e))?;
        rows.iter().map(Self::project_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn update_project(
        &self,
        id: ProjectId,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<Project>> {
        let row = sqlx::query(
            r#"
            UPDATE projects
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                updated_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(name)
        .bind(description)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("update project", e))?;
        row.as_ref().map(Self::project_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn provision_project_records(
        &self,
        project: &Project,
        credentials: &[ProjectCredential],
        keys: &[ApiKey],
        buckets: &[LogicalBucket],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend("begin provision tx", e))?;
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, slug, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(project.id.0)
        .bind(&project.name)
        .bind(&project.slug)
        .bind(&project.description)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(format!("project slug '{}' already exists", project.slug))
            }
            _ => Error::backend("insert project", e),
        })?;
        for cred in credentials {
            sqlx::query(
                r#"
                INSERT INTO project_db_creds (project_id, principal, ciphertext, iv, auth_tag, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(cred.project_id.0)
            .bind(cred.principal.as_str())
            .bind(&cred.payload.ciphertext)
            .bind(&cred.payload.iv)
            .bind(&cred.payload.auth_tag)
            .bind(cred.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::backend("insert credential", e))?;
        }
        for key in keys {
            sqlx::query(
                r#"
                INSERT INTO api_keys (id, project_id, key_type, hash, prefix, created_at, expires_at, revoked_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(key.id)
            .bind(key.project_id.0)
            .bind(key.key_type.as_str())
            .bind(&key.hash)
            .bind(&key.prefix)
            .bind(key.created_at)
            .bind(key.expires_at)
            .bind(key.revoked_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::backend("insert api key", e))?;
        }
        for bucket in buckets {
            sqlx::query(
                r#"
                INSERT INTO buckets (id, project_id, name, created_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(bucket.id)
            .bind(bucket.project_id.0)
            .bind(&bucket.name)
            .bind(bucket.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::backend("insert bucket", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::backend("commit provision tx", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_project_cascade(&self, id: ProjectId) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend("begin project delete tx", e))?;
        for stmt in [
            "DELETE FROM file_metadata WHERE project_id = $1",
            "DELETE FROM buckets WHERE project_id = $1",
            "DELETE FROM api_keys WHERE project_id = $1",
            "DELETE FROM project_db_creds WHERE project_id = $1",
            "DELETE FROM audit_logs WHERE project_id = $1",
        ] {
            sqlx::query(stmt)
                .bind(id.0)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::backend("project cascade delete", e))?;
        }
        let res = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::backend("delete project", e))?;
        tx.commit()
            .await
            .map_err(|e| Error::backend("commit project delete tx", e))?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self, credential))]
    async fn insert_credential(&self, credential: &ProjectCredential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_db_creds (project_id, principal, ciphertext, iv, auth_tag, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(credential.project_id.0)
        .bind(credential.principal.as_str())
        .bind(&credential.payload.ciphertext)
        .bind(&credential.payload.iv)
        .bind(&credential.payload.auth_tag)
        .bind(credential.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("insert credential", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_credential(
        &self,
        project_id: ProjectId,
        principal: DbPrincipal,
    ) -> Result<Option<ProjectCredential>> {
        let row = sqlx::query(
            "SELECT * FROM project_db_creds WHERE project_id = $1 AND principal = $2",
        )
        .bind(project_id.0)
        .bind(principal.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("get credential", e))?;
        row.as_ref().map(Self::credential_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self, key))]
    async fn insert_api_key(&self, key: &ApiKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, project_id, key_type, hash, prefix, created_at, expires_at, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(key.id)
        .bind(key.project_id.0)
        .bind(key.key_type.as_str())
        .bind(&key.hash)
        .bind(&key.prefix)
        .bind(key.created_at)
        .bind(key.expires_at)
        .bind(key.revoked_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("insert api key", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_api_key(&self, id: Uuid) -> Result<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get api key", e))?;
        row.as_ref().map(Self::api_key_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_api_keys(&self, project_id: ProjectId) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query(
            "SELECT * FROM api_keys WHERE project_id = $1 ORDER BY created_at DESC",
        )
        .bind(project_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list api keys", e))?;
        rows.iter().map(Self::api_key_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_active_api_keys(&self, now: DateTime<Utc>) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM api_keys
            WHERE revoked_at IS NULL AND (expires_at IS NULL OR expires_at > $1)
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list active api keys", e))?;
        rows.iter().map(Self::api_key_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn revoke_api_key(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE api_keys SET revoked_at = $2
            WHERE id = $1 AND revoked_at IS NULL AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("revoke api key", e))?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self, new_key))]
    async fn rotate_api_keys(
        &self,
        project_id: ProjectId,
        key_type: ApiKeyType,
        new_key: &ApiKey,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend("begin rotate tx", e))?;
        sqlx::query(
            r#"
            UPDATE api_keys SET revoked_at = $3
            WHERE project_id = $1 AND key_type = $2 AND revoked_at IS NULL
            "#,
        )
        .bind(project_id.0)
        .bind(key_type.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::backend("revoke keys for rotation", e))?;
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, project_id, key_type, hash, prefix, created_at, expires_at, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(new_key.id)
        .bind(new_key.project_id.0)
        .bind(new_key.key_type.as_str())
        .bind(&new_key.hash)
        .bind(&new_key.prefix)
        .bind(new_key.created_at)
        .bind(new_key.expires_at)
        .bind(new_key.revoked_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::backend("insert rotated key", e))?;
        tx.commit()
            .await
            .map_err(|e| Error::backend("commit rotate tx", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, bucket))]
    async fn insert_bucket(&self, bucket: &LogicalBucket) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO buckets (id, project_id, name, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(bucket.id)
        .bind(bucket.project_id.0)
        .bind(&bucket.name)
        .bind(bucket.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(format!("bucket '{}' already exists", bucket.name))
            }
            _ => Error::backend("insert bucket", e),
        })?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_bucket(&self, project_id: ProjectId, name: &str) -> Result<Option<LogicalBucket>> {
        let row = sqlx::query("SELECT * FROM buckets WHERE project_id = $1 AND name = $2")
            .bind(project_id.0)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get bucket", e))?;
        row.as_ref().map(Self::bucket_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_buckets(&self, project_id: ProjectId) -> Result<Vec<LogicalBucket>> {
        let rows = sqlx::query("SELECT * FROM buckets WHERE project_id = $1 ORDER BY name")
            .bind(project_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::backend("list buckets", e))?;
        rows.iter().map(Self::bucket_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, meta))]
    async fn upsert_file_metadata(&self, meta: &FileMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_metadata (id, project_id, logical_bucket, object_key, content_type, size_bytes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (project_id, object_key) DO UPDATE
              SET logical_bucket = EXCLUDED.logical_bucket,
                  content_type = EXCLUDED.content_type,
                  size_bytes = EXCLUDED.size_bytes
            "#,
        )
        .bind(meta.id)
        .bind(meta.project_id.0)
        .bind(&meta.logical_bucket)
        .bind(&meta.object_key)
        .bind(&meta.content_type)
        .bind(meta.size_bytes)
        .bind(meta.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("upsert file metadata", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_file_metadata(
        &self,
        project_id: ProjectId,
        logical_bucket: Option<&str>,
        query: ListQuery,
    ) -> Result<Vec<FileMetadata>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM file_metadata
            WHERE project_id = $1 AND ($2::text IS NULL OR logical_bucket = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(project_id.0)
        .bind(logical_bucket)
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list file metadata", e))?;
        rows.iter().map(Self::file_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_file_metadata(&self, project_id: ProjectId, object_key: &str) -> Result<bool> {
        let res = sqlx::query(
            "DELETE FROM file_metadata WHERE project_id = $1 AND object_key = $2",
        )
        .bind(project_id.0)
        .bind(object_key)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("delete file metadata", e))?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self, entry))]
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, project_id, user_id, action, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.project_id.map(|p| p.0))
        .bind(entry.user_id.map(|u| u.0))
        .bind(&entry.action)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("append audit", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_audit(
        &self,
        project_id: Option<ProjectId>,
        query: ListQuery,
    ) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM audit_logs
            WHERE ($1::uuid IS NULL OR project_id = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(project_id.map(|p| p.0))
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list audit", e))?;
        rows.iter().map(Self::audit_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, backup))]
    async fn insert_backup(&self, backup: &Backup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backups
              (id, project_id, backup_type, table_name, object_key, size_bytes, format, status,
               error_message, retention_days, expires_at, created_by, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(backup.id)
        .bind(backup.project_id.map(|p| p.0))
        .bind(backup.backup_type.as_str())
        .bind(&backup.table_name)
        .bind(&backup.object_key)
        .bind(backup.size_bytes)
        .bind(backup.format.as_str())
        .bind(backup.status.as_str())
        .bind(&backup.error_message)
        .bind(backup.retention_days)
        .bind(backup.expires_at)
        .bind(backup.created_by.map(|u| u.0))
        .bind(backup.created_at)
        .bind(backup.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("insert backup", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        let row = sqlx::query("SELECT * FROM backups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get backup", e))?;
        row.as_ref().map(Self::backup_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_backups(&self, query: BackupQuery) -> Result<Vec<Backup>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM backups
            WHERE ($1::uuid IS NULL OR project_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(query.project_id.map(|p| p.0))
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.limit.max(1) as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list backups", e))?;
        rows.iter().map(Self::backup_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn mark_backup_running(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE backups SET status = 'running' WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("mark backup running", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn complete_backup(&self, id: Uuid, size_bytes: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE backups SET status = 'completed', size_bytes = $2, completed_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(size_bytes)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("complete backup", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn fail_backup(&self, id: Uuid, error_message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE backups SET status = 'failed', error_message = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("fail backup", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_backup(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("delete backup", e))?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_completed_project_backups(&self, project_id: ProjectId) -> Result<Vec<Backup>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM backups
            WHERE project_id = $1 AND backup_type = 'project' AND status = 'completed'
            ORDER BY created_at DESC
            "#,
        )
        .bind(project_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list completed project backups", e))?;
        rows.iter().map(Self::backup_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_expired_backups(&self, now: DateTime<Utc>) -> Result<Vec<Backup>> {
        let rows = sqlx::query(
            "SELECT * FROM backups WHERE expires_at IS NOT NULL AND expires_at < $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list expired backups", e))?;
        rows.iter().map(Self::backup_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, job))]
    async fn upsert_cron_job(&self, job: &CronJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cron_jobs
              (id, project_id, name, job_type, cron_expr, timezone, http_url, http_method,
               encrypted_headers, encrypted_body, platform_action, platform_config, enabled,
               timeout_ms, retries, retry_backoff_ms, last_run_at, next_run_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (id) DO UPDATE
              SET name = EXCLUDED.name,
                  job_type = EXCLUDED.job_type,
                  cron_expr = EXCLUDED.cron_expr,
                  timezone = EXCLUDED.timezone,
                  http_url = EXCLUDED.http_url,
                  http_method = EXCLUDED.http_method,
                  encrypted_headers = EXCLUDED.encrypted_headers,
                  encrypted_body = EXCLUDED.encrypted_body,
                  platform_action = EXCLUDED.platform_action,
                  platform_config = EXCLUDED.platform_config,
                  enabled = EXCLUDED.enabled,
                  timeout_ms = EXCLUDED.timeout_ms,
                  retries = EXCLUDED.retries,
                  retry_backoff_ms = EXCLUDED.retry_backoff_ms,
                  last_run_at = EXCLUDED.last_run_at,
                  next_run_at = EXCLUDED.next_run_at,
                  updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job.id)
        .bind(job.project_id.map(|p| p.0))
        .bind(&job.name)
        .bind(job.job_type.as_str())
        .bind(&job.cron_expr)
        .bind(&job.timezone)
        .bind(&job.http_url)
        .bind(&job.http_method)
        .bind(job.encrypted_headers.clone().map(sqlx::types::Json))
        .bind(job.encrypted_body.clone().map(sqlx::types::Json))
        .bind(&job.platform_action)
        .bind(&job.platform_config)
        .bind(job.enabled)
        .bind(job.timeout_ms)
        .bind(job.retries)
        .bind(job.retry_backoff_ms)
        .bind(job.last_run_at)
        .bind(job.next_run_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("upsert cron job", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_cron_job(&self, id: Uuid) -> Result<Option<CronJob>> {
        let row = sqlx::query("SELECT * FROM cron_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get cron job", e))?;
        row.as_ref().map(Self::cron_job_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_cron_jobs(&self, enabled_only: bool) -> Result<Vec<CronJob>> {
        let rows = sqlx::query(
            "SELECT * FROM cron_jobs WHERE NOT $1 OR enabled ORDER BY created_at",
        )
        .bind(enabled_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list cron jobs", e))?;
        rows.iter().map(Self::cron_job_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_cron_job(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query("DELETE FROM cron_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("delete cron job", e))?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn set_cron_job_runtimes(
        &self,
        id: Uuid,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cron_jobs
            SET last_run_at = COALESCE($2, last_run_at),
                next_run_at = COALESCE($3, next_run_at),
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last_run_at)
        .bind(next_run_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("set cron job runtimes", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, run))]
    async fn insert_cron_run(&self, run: &CronJobRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cron_job_runs
              (id, job_id, attempt_number, started_at, finished_at, duration_ms, status,
               http_status, error_text, log_preview)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(run.id)
        .bind(run.job_id)
        .bind(run.attempt_number)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.duration_ms)
        .bind(run.status.as_str())
        .bind(run.http_status)
        .bind(&run.error_text)
        .bind(&run.log_preview)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("insert cron run", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, run))]
    async fn update_cron_run(&self, run: &CronJobRun) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cron_job_runs
            SET finished_at = $2, duration_ms = $3, status = $4, http_status = $5,
                error_text = $6, log_preview = $7
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.finished_at)
        .bind(run.duration_ms)
        .bind(run.status.as_str())
        .bind(run.http_status)
        .bind(&run.error_text)
        .bind(&run.log_preview)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("update cron run", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_cron_runs(&self, job_id: Uuid, query: ListQuery) -> Result<Vec<CronJobRun>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM cron_job_runs WHERE job_id = $1
            ORDER BY started_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(job_id)
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list cron runs", e))?;
        rows.iter().map(Self::cron_run_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, user))]
    async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, email, display_name, role, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE
              SET email = EXCLUDED.email,
                  display_name = EXCLUDED.display_name,
                  role = EXCLUDED.role
            "#,
        )
        .bind(user.user_id.0)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.role.as_str())
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(format!("email '{}' already registered", user.email))
            }
            _ => Error::backend("upsert user", e),
        })?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get user", e))?;
        row.as_ref().map(Self::user_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get user by email", e))?;
        row.as_ref().map(Self::user_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_users(&self, query: ListQuery) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY created_at LIMIT $1 OFFSET $2")
            .bind(query.limit as i64)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::backend("list users", e))?;
        rows.iter().map(Self::user_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_user(&self, user_id: UserId) -> Result<bool> {
        let res = sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user_id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("delete user", e))?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self, invite))]
    async fn insert_invite(&self, invite: &InviteKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO invite_keys (id, token_hash, role, created_by, expires_at, used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(invite.id)
        .bind(&invite.token_hash)
        .bind(invite.role.as_str())
        .bind(invite.created_by.map(|u| u.0))
        .bind(invite.expires_at)
        .bind(invite.used_at)
        .bind(invite.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("insert invite", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, token_hash))]
    async fn get_invite_by_hash(&self, token_hash: &str) -> Result<Option<InviteKey>> {
        let row = sqlx::query("SELECT * FROM invite_keys WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get invite", e))?;
        row.as_ref().map(Self::invite_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn mark_invite_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE invite_keys SET used_at = $2 WHERE id = $1 AND used_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("mark invite used", e))?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_invites(&self, query: ListQuery) -> Result<Vec<InviteKey>> {
        let rows = sqlx::query(
            "SELECT * FROM invite_keys ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list invites", e))?;
        rows.iter().map(Self::invite_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, token_hash))]
    async fn get_session(&self, token_hash: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("get session", e))?;
        row.as_ref().map(Self::session_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self, session))]
    async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (token_hash, user_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&session.token_hash)
        .bind(session.user_id.0)
        .bind(session.expires_at)
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("insert session", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, token_hash))]
    async fn delete_session(&self, token_hash: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("delete session", e))?;
        Ok(res.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn load_runtime_settings(&self) -> Result<Option<RuntimeSettings>> {
        let row = sqlx::query("SELECT data FROM runtime_settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::backend("load runtime settings", e))?;
        match row {
            None => Ok(None),
            Some(r) => {
                let data: serde_json::Value =
                    r.try_get("data").map_err(|e| Error::backend("data", e))?;
                let settings = serde_json::from_value(data)
                    .map_err(|e| Error::BackendMessage(format!("decode runtime settings: {e}")))?;
                Ok(Some(settings))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, settings))]
    async fn save_runtime_settings(&self, settings: &RuntimeSettings) -> Result<()> {
        let data = serde_json::to_value(settings)
            .map_err(|e| Error::Internal(format!("encode runtime settings: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO runtime_settings (id, data, updated_at)
            VALUES (1, $1, $2)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("save runtime settings", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn platform_stats(&self, now: DateTime<Utc>) -> Result<PlatformStats> {
        let row = sqlx::query(
            r#"
            SELECT
              (SELECT COUNT(*) FROM projects) AS projects,
              (SELECT COUNT(*) FROM api_keys
                 WHERE revoked_at IS NULL AND (expires_at IS NULL OR expires_at > $1)) AS active_api_keys,
              (SELECT COUNT(*) FROM backups) AS backups_total,
              (SELECT COUNT(*) FROM backups WHERE status = 'completed') AS backups_completed,
              (SELECT COUNT(*) FROM file_metadata) AS files,
              (SELECT COALESCE(SUM(size_bytes), 0)::bigint FROM file_metadata) AS file_bytes
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::backend("platform stats", e))?;
        Ok(PlatformStats {
            projects: row
                .try_get("projects")
                .map_err(|e| Error::backend("projects", e))?,
            active_api_keys: row
                .try_get("active_api_keys")
                .map_err(|e| Error::backend("active_api_keys", e))?,
            backups_total: row
                .try_get("backups_total")
                .map_err(|e| Error::backend("backups_total", e))?,
            backups_completed: row
                .try_get("backups_completed")
                .map_err(|e| Error::backend("backups_completed", e))?,
            files: row
                .try_get("files")
                .map_err(|e| Error::backend("files", e))?,
            file_bytes: row
                .try_get("file_bytes")
                .map_err(|e| Error::backend("file_bytes", e))?,
        })
    }
}

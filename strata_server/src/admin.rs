//! Admin API: project lifecycle, keys, SQL executor, storage dashboard,
//! backups, settings, users and invites, jobs, and stats. All handlers
//! require a session-authenticated user.

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use strata_core::backup::CreateBackupInput;
use strata_core::config::RuntimeSettings;
use strata_core::crud::TableSchema;
use strata_core::crypto::{generate_invite_token, sha256_hex};
use strata_core::models::{
    ApiKey, ApiKeyType, AuditEntry, Backup, BackupFormat, BackupStatus, BackupType, CronJob,
    CronJobRun, CronJobType, FileMetadata, InviteKey, ListQuery, LogicalBucket, Project,
    ProjectId, UserId, UserRecord, UserRole,
};
use strata_core::sqlexec::SqlResult;
use strata_core::store::{BackupQuery, PlatformStats};
use strata_core::tenant::CreateProjectInput;

use crate::error::ApiError;
use crate::extract::AdminUser;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .route("/admin/projects", get(list_projects).post(create_project))
        .route(
            "/admin/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/admin/projects/{id}/keys", get(list_keys))
        .route("/admin/projects/{id}/keys/rotate", post(rotate_key))
        .route("/admin/keys/{key_id}", delete(revoke_key))
        .route("/admin/projects/{id}/sql", post(execute_sql))
        .route("/admin/projects/{id}/tables", get(list_tables))
        .route("/admin/projects/{id}/storage", get(storage_dashboard))
        .route("/admin/backups", get(list_backups).post(create_backup))
        .route("/admin/backups/retention", post(run_retention))
        .route("/admin/backups/cleanup-expired", post(cleanup_expired))
        .route("/admin/backups/{id}", get(get_backup).delete(delete_backup))
        .route("/admin/backups/{id}/restore", post(restore_backup))
        .route("/admin/backups/{id}/download", get(download_backup))
        .route("/admin/settings", get(get_settings).put(put_settings))
        .route("/admin/users", get(list_users).post(create_user))
        .route("/admin/users/{id}", delete(delete_user))
        .route("/admin/invites", get(list_invites).post(create_invite))
        .route("/admin/audit", get(list_audit))
        .route("/admin/jobs", get(list_jobs).post(upsert_job))
        .route("/admin/jobs/sync", post(sync_jobs))
        .route("/admin/jobs/{id}", get(get_job).delete(delete_job))
        .route("/admin/jobs/{id}/runs", get(list_job_runs))
        .route("/admin/stats", get(get_stats))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn audit(
    state: &AppState,
    user: &AdminUser,
    project_id: Option<ProjectId>,
    action: &str,
    details: serde_json::Value,
) {
    let entry = AuditEntry::new(project_id, Some(user.0.user_id), action, details);
    if let Err(e) = state.store.append_audit(&entry).await {
        tracing::warn!(action = %action, error = %e, "audit write failed");
    }
}

fn require_admin(user: &AdminUser) -> Result<(), ApiError> {
    if user.0.role == UserRole::Admin {
        Ok(())
    } else {
        Err(ApiError::Core(strata_core::Error::Forbidden(
            "admin role required".to_string(),
        )))
    }
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl PageQuery {
    fn list(&self) -> ListQuery {
        ListQuery {
            limit: self.limit.unwrap_or(100).clamp(1, 1000),
            offset: self.offset.unwrap_or(0),
        }
    }
}

// Projects.

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_projects(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.store.list_projects(page.list()).await?))
}

#[derive(Deserialize)]
pub struct CreateProjectBody {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectResponse {
    pub project: Project,
    pub publishable_key: String,
    pub secret_key: String,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn create_project(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<CreateProjectBody>,
) -> Result<(StatusCode, Json<CreateProjectResponse>), ApiError> {
    let created = state
        .provisioner
        .create(
            CreateProjectInput {
                name: body.name,
                description: body.description,
            },
            Some(user.0.user_id),
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateProjectResponse {
            project: created.project,
            publishable_key: created.publishable_key,
            secret_key: created.secret_key,
        }),
    ))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_project(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<ProjectId>,
) -> Result<Json<Project>, ApiError> {
    let project = state
        .store
        .get_project(id)
        .await?
        .ok_or_else(|| strata_core::Error::NotFound(format!("project {id}")))?;
    Ok(Json(project))
}

#[derive(Deserialize)]
pub struct UpdateProjectBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn update_project(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<ProjectId>,
    Json(body): Json<UpdateProjectBody>,
) -> Result<Json<Project>, ApiError> {
    let project = state
        .store
        .update_project(id, body.name.as_deref(), body.description.as_deref())
        .await?
        .ok_or_else(|| strata_core::Error::NotFound(format!("project {id}")))?;
    audit(
        &state,
        &user,
        Some(id),
        "project.updated",
        serde_json::json!({ "name": project.name }),
    )
    .await;
    Ok(Json(project))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn delete_project(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<ProjectId>,
) -> Result<StatusCode, ApiError> {
    state.provisioner.delete(id, Some(user.0.user_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// API keys.

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_keys(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<ProjectId>,
) -> Result<Json<Vec<ApiKey>>, ApiError> {
    Ok(Json(state.store.list_api_keys(id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateKeyBody {
    pub key_type: ApiKeyType,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateKeyResponse {
    pub key: ApiKey,
    pub plaintext: String,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn rotate_key(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<ProjectId>,
    Json(body): Json<RotateKeyBody>,
) -> Result<Json<RotateKeyResponse>, ApiError> {
    let issued = state.keys.rotate(id, body.key_type).await?;
    audit(
        &state,
        &user,
        Some(id),
        "api_key.rotated",
        serde_json::json!({ "keyType": body.key_type.as_str(), "keyId": issued.key.id }),
    )
    .await;
    Ok(Json(RotateKeyResponse {
        key: issued.key,
        plaintext: issued.plaintext,
    }))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn revoke_key(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(key_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.keys.revoke(key_id).await?;
    audit(
        &state,
        &user,
        None,
        "api_key.revoked",
        serde_json::json!({ "keyId": key_id }),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

// SQL executor and introspection.

#[derive(Deserialize)]
pub struct SqlBody {
    pub sql: String,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn execute_sql(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<ProjectId>,
    Json(body): Json<SqlBody>,
) -> Result<Json<SqlResult>, ApiError> {
    let result = state.sqlexec.execute(id, &body.sql).await?;
    audit(
        &state,
        &user,
        Some(id),
        "sql.executed",
        serde_json::json!({ "rowCount": result.row_count, "ms": result.execution_time_ms }),
    )
    .await;
    Ok(Json(result))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_tables(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<ProjectId>,
) -> Result<Json<Vec<TableSchema>>, ApiError> {
    Ok(Json(state.crud.list_tables(id).await?))
}

// Storage dashboard.

#[derive(Deserialize)]
pub struct StorageQuery {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Serialize)]
pub struct StorageDashboard {
    pub buckets: Vec<LogicalBucket>,
    pub files: Vec<FileMetadata>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn storage_dashboard(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<ProjectId>,
    Query(query): Query<StorageQuery>,
) -> Result<Json<StorageDashboard>, ApiError> {
    let buckets = state.store.list_buckets(id).await?;
    let files = state
        .store
        .list_file_metadata(
            id,
            query.bucket.as_deref(),
            ListQuery {
                limit: query.limit.unwrap_or(100).clamp(1, 1000),
                offset: query.offset.unwrap_or(0),
            },
        )
        .await?;
    Ok(Json(StorageDashboard { buckets, files }))
}

// Backups.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupListQuery {
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_backups(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<BackupListQuery>,
) -> Result<Json<Vec<Backup>>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(BackupStatus::parse_str(raw).ok_or_else(|| {
            ApiError::Validation(format!("invalid backup status '{raw}'"))
        })?),
    };
    let backups = state
        .store
        .list_backups(BackupQuery {
            project_id: query.project_id,
            status,
            limit: query.limit.unwrap_or(100).clamp(1, 1000),
            offset: query.offset.unwrap_or(0),
        })
        .await?;
    Ok(Json(backups))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupBody {
    pub backup_type: BackupType,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub format: Option<BackupFormat>,
    #[serde(default)]
    pub retention_days: Option<i32>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn create_backup(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<CreateBackupBody>,
) -> Result<(StatusCode, Json<Backup>), ApiError> {
    let backup = state
        .backups
        .create(
            CreateBackupInput {
                backup_type: body.backup_type,
                project_id: body.project_id,
                table_name: body.table_name,
                format: body.format,
                retention_days: body.retention_days,
            },
            Some(user.0.user_id),
        )
        .await?;
    audit(
        &state,
        &user,
        body.project_id,
        "backup.created",
        serde_json::json!({ "backupId": backup.id, "type": backup.backup_type.as_str() }),
    )
    .await;
    // The dump runs detached; 202 hands the row back for polling.
    Ok((StatusCode::ACCEPTED, Json(backup)))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_backup(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Backup>, ApiError> {
    let backup = state
        .store
        .get_backup(id)
        .await?
        .ok_or_else(|| strata_core::Error::NotFound(format!("backup {id}")))?;
    Ok(Json(backup))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn delete_backup(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.backups.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct RestoreResponse {
    pub warnings: Vec<String>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn restore_backup(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RestoreResponse>, ApiError> {
    let outcome = state.backups.restore(id).await?;
    audit(
        &state,
        &user,
        None,
        "backup.restored",
        serde_json::json!({ "backupId": id, "warnings": outcome.warnings.len() }),
    )
    .await;
    Ok(Json(RestoreResponse {
        warnings: outcome.warnings,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub download_url: String,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn download_backup(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let url = state.backups.download_url(id).await?;
    Ok(Json(DownloadResponse { download_url: url }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionBody {
    #[serde(default)]
    pub project_id: Option<ProjectId>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn run_retention(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<RetentionBody>,
) -> Result<Json<strata_core::backup::RetentionSummary>, ApiError> {
    Ok(Json(state.backups.run_retention(body.project_id).await?))
}

#[derive(Serialize)]
pub struct CleanupResponse {
    pub deleted: usize,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn cleanup_expired(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<CleanupResponse>, ApiError> {
    Ok(Json(CleanupResponse {
        deleted: state.backups.cleanup_expired().await?,
    }))
}

// Settings.

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_settings(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<RuntimeSettings>, ApiError> {
    Ok(Json(state.settings.snapshot()))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn put_settings(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<RuntimeSettings>,
) -> Result<Json<RuntimeSettings>, ApiError> {
    if body.sql_max_rows == 0 {
        return Err(ApiError::Validation("sqlMaxRows must be > 0".to_string()));
    }
    if body.sql_statement_timeout_ms == 0 {
        return Err(ApiError::Validation(
            "sqlStatementTimeoutMs must be > 0".to_string(),
        ));
    }
    state.store.save_runtime_settings(&body).await?;
    state.settings.replace(body.clone());
    audit(
        &state,
        &user,
        None,
        "settings.updated",
        serde_json::to_value(&body).unwrap_or_default(),
    )
    .await;
    Ok(Json(body))
}

// Users and invites.

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_users(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<UserRecord>>, ApiError> {
    require_admin(&user)?;
    Ok(Json(state.store.list_users(page.list()).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserBody {
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub role: UserRole,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn create_user(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<CreateUserBody>,
) -> Result<(StatusCode, Json<UserRecord>), ApiError> {
    require_admin(&user)?;
    let email = body.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::Validation("invalid email".to_string()));
    }
    let record = UserRecord {
        user_id: UserId(Uuid::new_v4()),
        email,
        display_name: body.display_name,
        role: body.role,
        created_at: Utc::now(),
    };
    state.store.upsert_user(&record).await?;
    audit(
        &state,
        &user,
        None,
        "user.created",
        serde_json::json!({ "userId": record.user_id, "role": record.role.as_str() }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(record)))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn delete_user(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<UserId>,
) -> Result<StatusCode, ApiError> {
    require_admin(&user)?;
    if user.0.user_id == id {
        return Err(ApiError::Validation(
            "cannot delete your own account".to_string(),
        ));
    }
    if !state.store.delete_user(id).await? {
        return Err(strata_core::Error::NotFound(format!("user {id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_invites(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<InviteKey>>, ApiError> {
    require_admin(&user)?;
    Ok(Json(state.store.list_invites(page.list()).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInviteBody {
    pub role: UserRole,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct CreateInviteResponse {
    pub invite: InviteKey,
    pub token: String,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn create_invite(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<CreateInviteBody>,
) -> Result<(StatusCode, Json<CreateInviteResponse>), ApiError> {
    require_admin(&user)?;
    let token = generate_invite_token();
    let invite = InviteKey {
        id: Uuid::new_v4(),
        token_hash: sha256_hex(token.as_bytes()),
        role: body.role,
        created_by: Some(user.0.user_id),
        expires_at: body.expires_at,
        used_at: None,
        created_at: Utc::now(),
    };
    state.store.insert_invite(&invite).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateInviteResponse { invite, token }),
    ))
}

// Audit.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditListQuery {
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_audit(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<AuditListQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let entries = state
        .store
        .list_audit(
            query.project_id,
            ListQuery {
                limit: query.limit.unwrap_or(100).clamp(1, 1000),
                offset: query.offset.unwrap_or(0),
            },
        )
        .await?;
    Ok(Json(entries))
}

// Cron jobs.

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_jobs(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<CronJob>>, ApiError> {
    Ok(Json(state.store.list_cron_jobs(false).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertJobBody {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    pub job_type: CronJobType,
    pub cron_expr: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    /// Plaintext header map; encrypted before persistence.
    #[serde(default)]
    pub headers: Option<std::collections::BTreeMap<String, String>>,
    /// Plaintext body; encrypted before persistence.
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub platform_action: Option<String>,
    #[serde(default)]
    pub platform_config: Option<serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    #[serde(default)]
    pub retries: Option<i32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<i64>,
}

fn default_enabled() -> bool {
    true
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn upsert_job(
    user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<UpsertJobBody>,
) -> Result<(StatusCode, Json<CronJob>), ApiError> {
    // Reject bad expressions at write time rather than at arm install.
    strata_core::scheduler::next_fire(
        &body.cron_expr,
        body.timezone.as_deref().unwrap_or("UTC"),
        Utc::now(),
    )
    .map_err(|e| ApiError::Validation(e.to_string()))?;

    match body.job_type {
        CronJobType::Http => {
            if body.url.is_none() {
                return Err(ApiError::Validation("http jobs require url".to_string()));
            }
        }
        CronJobType::Platform => {
            if body.platform_action.is_none() {
                return Err(ApiError::Validation(
                    "platform jobs require platformAction".to_string(),
                ));
            }
        }
    }

    let encrypted_headers = match &body.headers {
        None => None,
        Some(headers) => {
            let json = serde_json::to_string(headers)
                .map_err(|e| ApiError::Validation(format!("headers: {e}")))?;
            Some(state.crypto.encrypt_str(&json)?)
        }
    };
    let encrypted_body = match &body.body {
        None => None,
        Some(text) => Some(state.crypto.encrypt_str(text)?),
    };

    let now = Utc::now();
    let existing = match body.id {
        Some(id) => state.store.get_cron_job(id).await?,
        None => None,
    };
    let job = CronJob {
        id: body.id.unwrap_or_else(Uuid::new_v4),
        project_id: body.project_id,
        name: body.name,
        job_type: body.job_type,
        cron_expr: body.cron_expr,
        timezone: body.timezone.unwrap_or_else(|| "UTC".to_string()),
        http_url: body.url,
        http_method: body.method,
        encrypted_headers,
        encrypted_body,
        platform_action: body.platform_action,
        platform_config: body.platform_config,
        enabled: body.enabled,
        timeout_ms: body.timeout_ms.unwrap_or(30_000),
        retries: body.retries.unwrap_or(0).max(0),
        retry_backoff_ms: body.retry_backoff_ms.unwrap_or(1_000).max(0),
        last_run_at: existing.as_ref().and_then(|j| j.last_run_at),
        next_run_at: existing.as_ref().and_then(|j| j.next_run_at),
        created_at: existing.as_ref().map(|j| j.created_at).unwrap_or(now),
        updated_at: now,
    };
    state.store.upsert_cron_job(&job).await?;
    audit(
        &state,
        &user,
        job.project_id,
        "cron_job.upserted",
        serde_json::json!({ "jobId": job.id, "name": job.name }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(job)))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_job(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CronJob>, ApiError> {
    let job = state
        .store
        .get_cron_job(id)
        .await?
        .ok_or_else(|| strata_core::Error::NotFound(format!("job {id}")))?;
    Ok(Json(job))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn delete_job(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !state.store.delete_cron_job(id).await? {
        return Err(strata_core::Error::NotFound(format!("job {id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_job_runs(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<CronJobRun>>, ApiError> {
    Ok(Json(state.store.list_cron_runs(id, page.list()).await?))
}

/// Force a registry sync instead of waiting for the poll interval.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn sync_jobs(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.sync_jobs().await?;
    Ok(StatusCode::NO_CONTENT)
}

// Stats.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: PlatformStats,
    pub uptime_seconds: u64,
    pub scheduler_jobs: usize,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_stats(
    _user: AdminUser,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.store.platform_stats(Utc::now()).await?;
    Ok(Json(StatsResponse {
        stats,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        scheduler_jobs: state.scheduler.active_jobs(),
    }))
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::crypto::EncryptedPayload;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

/// Tenant identifier. Each project owns a database, two roles, an object
/// namespace, API keys, and metadata.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The id with dashes stripped; used for deterministic database and
    /// role names.
    pub fn compact(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for ProjectId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for ProjectId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Platform user identifier (admin plane).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for UserId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// A provisioned project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The two database principals provisioned per project. Owner has DDL/DML;
/// app has row-level DML only.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbPrincipal {
    Owner,
    App,
}

impl DbPrincipal {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbPrincipal::Owner => "owner",
            DbPrincipal::App => "app",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(DbPrincipal::Owner),
            "app" => Some(DbPrincipal::App),
            _ => None,
        }
    }
}

/// Envelope-encrypted tenant connection descriptor. Exactly two rows exist
/// per project, one per principal. The plaintext never leaves the tenant
/// router or the backup engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCredential {
    pub project_id: ProjectId,
    pub principal: DbPrincipal,
    #[serde(flatten)]
    pub payload: EncryptedPayload,
    pub created_at: DateTime<Utc>,
}

/// API key tier. Secret keys are required for mutating CRUD and storage
/// listing; publishable keys are read-only-ish client keys.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyType {
    Publishable,
    Secret,
}

impl ApiKeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyType::Publishable => "publishable",
            ApiKeyType::Secret => "secret",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "publishable" => Some(ApiKeyType::Publishable),
            "secret" => Some(ApiKeyType::Secret),
            _ => None,
        }
    }

    /// Plaintext key prefix (`pk` / `sk`).
    pub fn token_prefix(&self) -> &'static str {
        match self {
            ApiKeyType::Publishable => "pk",
            ApiKeyType::Secret => "sk",
        }
    }
}

/// Stored API key. `hash` is the SHA-256 hex of the plaintext; `prefix`
/// holds the first 8 characters for display only. Plaintext is returned
/// exactly once at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub key_type: ApiKeyType,
    #[serde(skip_serializing, default)]
    pub hash: String,
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

/// Resolved request context for a validated API key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    pub project_id: ProjectId,
    pub key_id: Uuid,
    pub key_type: ApiKeyType,
}

/// Named prefix inside a project's single physical bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalBucket {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Best-effort object metadata recorded on presigned-upload issuance. The
/// object store remains the ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub logical_bucket: String,
    pub object_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit entry. Audit writes never fail the calling operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub project_id: Option<ProjectId>,
    pub user_id: Option<UserId>,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        project_id: Option<ProjectId>,
        user_id: Option<UserId>,
        action: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            user_id,
            action: action.into(),
            details,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Platform,
    Project,
    Table,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Platform => "platform",
            BackupType::Project => "project",
            BackupType::Table => "table",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "platform" => Some(BackupType::Platform),
            "project" => Some(BackupType::Project),
            "table" => Some(BackupType::Table),
            _ => None,
        }
    }
}

/// Legal transitions: `pending -> running -> (completed | failed)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BackupStatus::Pending),
            "running" => Some(BackupStatus::Running),
            "completed" => Some(BackupStatus::Completed),
            "failed" => Some(BackupStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFormat {
    Sql,
    Csv,
    Json,
}

impl BackupFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupFormat::Sql => "sql",
            BackupFormat::Csv => "csv",
            BackupFormat::Json => "json",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "sql" => Some(BackupFormat::Sql),
            "csv" => Some(BackupFormat::Csv),
            "json" => Some(BackupFormat::Json),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

/// A backup row. `size_bytes` and `completed_at` are set only on entry to
/// `completed`. `type=project` requires `project_id`; `type=table`
/// additionally requires `table_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub id: Uuid,
    pub project_id: Option<ProjectId>,
    pub backup_type: BackupType,
    pub table_name: Option<String>,
    pub object_key: String,
    pub size_bytes: Option<i64>,
    pub format: BackupFormat,
    pub status: BackupStatus,
    pub error_message: Option<String>,
    pub retention_days: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronJobType {
    Http,
    Platform,
}

impl CronJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CronJobType::Http => "http",
            CronJobType::Platform => "platform",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "http" => Some(CronJobType::Http),
            "platform" => Some(CronJobType::Platform),
            _ => None,
        }
    }
}

/// A scheduled job. HTTP jobs carry envelope-encrypted headers/body whose
/// plaintext exists only inside a single dispatch; platform jobs name a
/// built-in action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: Uuid,
    pub project_id: Option<ProjectId>,
    pub name: String,
    pub job_type: CronJobType,
    pub cron_expr: String,
    pub timezone: String,
    pub http_url: Option<String>,
    pub http_method: Option<String>,
    #[serde(skip_serializing, default)]
    pub encrypted_headers: Option<EncryptedPayload>,
    #[serde(skip_serializing, default)]
    pub encrypted_body: Option<EncryptedPayload>,
    pub platform_action: Option<String>,
    pub platform_config: Option<serde_json::Value>,
    pub enabled: bool,
    pub timeout_ms: i64,
    pub retries: i32,
    pub retry_backoff_ms: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Fail,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Fail => "fail",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "fail" => Some(RunStatus::Fail),
            "timeout" => Some(RunStatus::Timeout),
            _ => None,
        }
    }
}

/// One attempt of one dispatch of a cron job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub attempt_number: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: RunStatus,
    pub http_status: Option<i32>,
    pub error_text: Option<String>,
    pub log_preview: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Member,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Member => "member",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(UserRole::Admin),
            "member" => Some(UserRole::Member),
            _ => None,
        }
    }
}

/// Platform (admin-plane) user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

/// Single-use invite. Only the token hash is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteKey {
    pub id: Uuid,
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    pub role: UserRole,
    pub created_by: Option<UserId>,
    pub expires_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Session issued by the external authentication service; consulted here
/// only to resolve admin requests to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Generic list query.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

//! Platform metadata store: typed accessors for the control-plane database.
//!
//! Multi-row invariants (project cascade delete, key rotation) are trait
//! methods so every backend runs them atomically; the Postgres backend
//! wraps them in one transaction. DDL never runs through this store.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RuntimeSettings;
use crate::models::{
    ApiKey, ApiKeyType, AuditEntry, Backup, BackupStatus, CronJob, CronJobRun, DbPrincipal,
    FileMetadata, InviteKey, ListQuery, LogicalBucket, Project, ProjectCredential, ProjectId,
    SessionRecord, UserId, UserRecord,
};
use crate::Result;

pub use memory::MemoryPlatformDb;
pub use postgres::PostgresPlatformDb;

/// Aggregate counters for the admin stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStats {
    pub projects: i64,
    pub active_api_keys: i64,
    pub backups_total: i64,
    pub backups_completed: i64,
    pub files: i64,
    pub file_bytes: i64,
}

/// Filter for backup listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupQuery {
    pub project_id: Option<ProjectId>,
    pub status: Option<BackupStatus>,
    pub limit: usize,
    pub offset: usize,
}

#[async_trait]
pub trait PlatformDb: Send + Sync {
    // Projects.
    async fn insert_project(&self, project: &Project) -> Result<()>;
    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>>;
    async fn get_project_by_slug(&self, slug: &str) -> Result<Option<Project>>;
    async fn list_projects(&self, query: ListQuery) -> Result<Vec<Project>>;
    async fn update_project(
        &self,
        id: ProjectId,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<Project>>;

    /// Insert a project together with its two encrypted credentials, its
    /// initial API keys, and its default logical buckets in one
    /// transaction, so a half-provisioned project never becomes visible.
    async fn provision_project_records(
        &self,
        project: &Project,
        credentials: &[ProjectCredential],
        keys: &[ApiKey],
        buckets: &[LogicalBucket],
    ) -> Result<()>;

    /// Delete a project and its dependents (file metadata, buckets, keys,
    /// credentials, audit rows) in one transaction. Tenant DDL and object
    /// storage are the provisioner's responsibility.
    async fn delete_project_cascade(&self, id: ProjectId) -> Result<bool>;

    // Credentials.
    async fn insert_credential(&self, credential: &ProjectCredential) -> Result<()>;
    async fn get_credential(
        &self,
        project_id: ProjectId,
        principal: DbPrincipal,
    ) -> Result<Option<ProjectCredential>>;

    // API keys.
    async fn insert_api_key(&self, key: &ApiKey) -> Result<()>;
    async fn get_api_key(&self, id: Uuid) -> Result<Option<ApiKey>>;
    async fn list_api_keys(&self, project_id: ProjectId) -> Result<Vec<ApiKey>>;
    /// All keys currently active (`revoked_at is null` and not expired).
    async fn list_active_api_keys(&self, now: DateTime<Utc>) -> Result<Vec<ApiKey>>;
    /// Set `revoked_at` iff the key is currently active. Returns whether a
    /// row changed.
    async fn revoke_api_key(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;
    /// Atomically revoke all active keys of `key_type` and insert `new_key`.
    async fn rotate_api_keys(
        &self,
        project_id: ProjectId,
        key_type: ApiKeyType,
        new_key: &ApiKey,
        now: DateTime<Utc>,
    ) -> Result<()>;

    // Logical buckets.
    async fn insert_bucket(&self, bucket: &LogicalBucket) -> Result<()>;
    async fn get_bucket(&self, project_id: ProjectId, name: &str) -> Result<Option<LogicalBucket>>;
    async fn list_buckets(&self, project_id: ProjectId) -> Result<Vec<LogicalBucket>>;

    // File metadata.
    async fn upsert_file_metadata(&self, meta: &FileMetadata) -> Result<()>;
    async fn list_file_metadata(
        &self,
        project_id: ProjectId,
        logical_bucket: Option<&str>,
        query: ListQuery,
    ) -> Result<Vec<FileMetadata>>;
    async fn delete_file_metadata(&self, project_id: ProjectId, object_key: &str) -> Result<bool>;

    // Audit. Callers treat failures as best-effort.
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
    async fn list_audit(
        &self,
        project_id: Option<ProjectId>,
        query: ListQuery,
    ) -> Result<Vec<AuditEntry>>;

    // Backups.
    async fn insert_backup(&self, backup: &Backup) -> Result<()>;
    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>>;
    async fn list_backups(&self, query: BackupQuery) -> Result<Vec<Backup>>;
    async fn mark_backup_running(&self, id: Uuid) -> Result<()>;
    async fn complete_backup(&self, id: Uuid, size_bytes: i64, at: DateTime<Utc>) -> Result<()>;
    async fn fail_backup(&self, id: Uuid, error_message: &str) -> Result<()>;
    async fn delete_backup(&self, id: Uuid) -> Result<bool>;
    /// Completed project-type backups for one project, newest first.
    async fn list_completed_project_backups(&self, project_id: ProjectId) -> Result<Vec<Backup>>;
    /// Backups whose legacy `expires_at` has passed.
    async fn list_expired_backups(&self, now: DateTime<Utc>) -> Result<Vec<Backup>>;

    // Cron jobs.
    async fn upsert_cron_job(&self, job: &CronJob) -> Result<()>;
    async fn get_cron_job(&self, id: Uuid) -> Result<Option<CronJob>>;
    async fn list_cron_jobs(&self, enabled_only: bool) -> Result<Vec<CronJob>>;
    async fn delete_cron_job(&self, id: Uuid) -> Result<bool>;
    async fn set_cron_job_runtimes(
        &self,
        id: Uuid,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn insert_cron_run(&self, run: &CronJobRun) -> Result<()>;
    async fn update_cron_run(&self, run: &CronJobRun) -> Result<()>;
    async fn list_cron_runs(&self, job_id: Uuid, query: ListQuery) -> Result<Vec<CronJobRun>>;

    // Users, invites, sessions.
    async fn upsert_user(&self, user: &UserRecord) -> Result<()>;
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    async fn list_users(&self, query: ListQuery) -> Result<Vec<UserRecord>>;
    async fn delete_user(&self, user_id: UserId) -> Result<bool>;

    async fn insert_invite(&self, invite: &InviteKey) -> Result<()>;
    async fn get_invite_by_hash(&self, token_hash: &str) -> Result<Option<InviteKey>>;
    async fn mark_invite_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;
    async fn list_invites(&self, query: ListQuery) -> Result<Vec<InviteKey>>;

    async fn get_session(&self, token_hash: &str) -> Result<Option<SessionRecord>>;
    async fn insert_session(&self, session: &SessionRecord) -> Result<()>;
    async fn delete_session(&self, token_hash: &str) -> Result<bool>;

    // Runtime settings persistence.
    async fn load_runtime_settings(&self) -> Result<Option<RuntimeSettings>>;
    async fn save_runtime_settings(&self, settings: &RuntimeSettings) -> Result<()>;

    // Stats.
    async fn platform_stats(&self, now: DateTime<Utc>) -> Result<PlatformStats>;
}

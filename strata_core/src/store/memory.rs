//! In-memory PlatformDb for unit tests and local development.
//!
//! Mirrors the Postgres backend's semantics closely enough for the
//! service layers: uniqueness on project slug, `(project, name)` buckets,
//! `(project, object_key)` file metadata, and atomic rotation/cascade.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::RuntimeSettings;
use crate::models::{
    ApiKey, ApiKeyType, AuditEntry, Backup, BackupStatus, BackupType, CronJob, CronJobRun,
    DbPrincipal, FileMetadata, InviteKey, ListQuery, LogicalBucket, Project, ProjectCredential,
    ProjectId, SessionRecord, UserId, UserRecord,
};
use crate::store::{BackupQuery, PlatformDb, PlatformStats};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    projects: Vec<Project>,
    credentials: Vec<ProjectCredential>,
    api_keys: Vec<ApiKey>,
    buckets: Vec<LogicalBucket>,
    files: Vec<FileMetadata>,
    audit: Vec<AuditEntry>,
    backups: Vec<Backup>,
    cron_jobs: Vec<CronJob>,
    cron_runs: Vec<CronJobRun>,
    users: Vec<UserRecord>,
    invites: Vec<InviteKey>,
    sessions: Vec<SessionRecord>,
    settings: Option<RuntimeSettings>,
}

#[derive(Clone, Default)]
pub struct MemoryPlatformDb {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryPlatformDb {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T: Clone>(items: Vec<T>, query: ListQuery) -> Vec<T> {
    items
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .collect()
}

#[async_trait]
impl PlatformDb for MemoryPlatformDb {
    async fn insert_project(&self, project: &Project) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.projects.iter().any(|p| p.slug == project.slug) {
            return Err(Error::Conflict(format!(
                "project slug '{}' already exists",
                project.slug
            )));
        }
        inner.projects.push(project.clone());
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let inner = self.inner.lock().await;
        Ok(inner.projects.iter().find(|p| p.id == id).cloned())
    }

    async fn get_project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        let inner = self.inner.lock().await;
        Ok(inner.projects.iter().find(|p| p.slug == slug).cloned())
    }

    async fn list_projects(&self, query: ListQuery) -> Result<Vec<Project>> {
        let inner = self.inner.lock().await;
        let mut all = inner.projects.clone();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(all, query))
    }

    async fn update_project(
        &self,
        id: ProjectId,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<Project>> {
        let mut inner = self.inner.lock().await;
        let Some(p) = inner.projects.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        if let Some(name) = name {
            p.name = name.to_string();
        }
        if let Some(description) = description {
            p.description = Some(description.to_string());
        }
        p.updated_at = Utc::now();
        Ok(Some(p.clone()))
    }

    async fn provision_project_records(
        &self,
        project: &Project,
        credentials: &[ProjectCredential],
        keys: &[ApiKey],
        buckets: &[LogicalBucket],
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.projects.iter().any(|p| p.slug == project.slug) {
            return Err(Error::Conflict(format!(
                "project slug '{}' already exists",
                project.slug
            )));
        }
        inner.projects.push(project.clone());
        inner.credentials.extend_from_slice(credentials);
        inner.api_keys.extend_from_slice(keys);
        inner.buckets.extend_from_slice(buckets);
        Ok(())
    }

    async fn delete_project_cascade(&self, id: ProjectId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.files.retain(|f| f.project_id != id);
        inner.buckets.retain(|b| b.project_id != id);
        inner.api_keys.retain(|k| k.project_id != id);
        inner.credentials.retain(|c| c.project_id != id);
        inner.audit.retain(|a| a.project_id != Some(id));
        let before = inner.projects.len();
        inner.projects.retain(|p| p.id != id);
        Ok(inner.projects.len() < before)
    }

    async fn insert_credential(&self, credential: &ProjectCredential) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .credentials
            .iter()
            .any(|c| c.project_id == credential.project_id && c.principal == credential.principal)
        {
            return Err(Error::Conflict("credential already exists".to_string()));
        }
        inner.credentials.push(credential.clone());
        Ok(())
    }

    async fn get_credential(
        &self,
        project_id: ProjectId,
        principal: DbPrincipal,
    ) -> Result<Option<ProjectCredential>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .credentials
            .iter()
            .find(|c| c.project_id == project_id && c.principal == principal)
            .cloned())
    }

    async fn insert_api_key(&self, key: &ApiKey) -> Result<()> {
        self.inner.lock().await.api_keys.push(key.clone());
        Ok(())
    }

    async fn get_api_key(&self, id: Uuid) -> Result<Option<ApiKey>> {
        let inner = self.inner.lock().await;
        Ok(inner.api_keys.iter().find(|k| k.id == id).cloned())
    }

    async fn list_api_keys(&self, project_id: ProjectId) -> Result<Vec<ApiKey>> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<ApiKey> = inner
            .api_keys
            .iter()
            .filter(|k| k.project_id == project_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn list_active_api_keys(&self, now: DateTime<Utc>) -> Result<Vec<ApiKey>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .api_keys
            .iter()
            .filter(|k| k.is_active(now))
            .cloned()
            .collect())
    }

    async fn revoke_api_key(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(k) = inner.api_keys.iter_mut().find(|k| k.id == id) else {
            return Ok(false);
        };
        if !k.is_active(now) {
            return Ok(false);
        }
        k.revoked_at = Some(now);
        Ok(true)
    }

    async fn rotate_api_keys(
        &self,
        project_id: ProjectId,
        key_type: ApiKeyType,
        new_key: &ApiKey,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for k in inner
            .api_keys
            .iter_mut()
            .filter(|k| k.project_id == project_id && k.key_type == key_type)
        {
            if k.revoked_at.is_none() {
                k.revoked_at = Some(now);
            }
        }
        inner.api_keys.push(new_key.clone());
        Ok(())
    }

    async fn insert_bucket(&self, bucket: &LogicalBucket) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .buckets
            .iter()
            .any(|b| b.project_id == bucket.project_id && b.name == bucket.name)
        {
            return Err(Error::Conflict(format!(
                "bucket '{}' already exists",
                bucket.name
            )));
        }
        inner.buckets.push(bucket.clone());
        Ok(())
    }

    async fn get_bucket(&self, project_id: ProjectId, name: &str) -> Result<Option<LogicalBucket>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .buckets
            .iter()
            .find(|b| b.project_id == project_id && b.name == name)
            .cloned())
    }

    async fn list_buckets(&self, project_id: ProjectId) -> Result<Vec<LogicalBucket>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<LogicalBucket> = inner
            .buckets
            .iter()
            .filter(|b| b.project_id == project_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn upsert_file_metadata(&self, meta: &FileMetadata) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .files
            .iter_mut()
            .find(|f| f.project_id == meta.project_id && f.object_key == meta.object_key)
        {
            existing.logical_bucket = meta.logical_bucket.clone();
            existing.content_type = meta.content_type.clone();
            existing.size_bytes = meta.size_bytes;
        } else {
            inner.files.push(meta.clone());
        }
        Ok(())
    }

    async fn list_file_metadata(
        &self,
        project_id: ProjectId,
        logical_bucket: Option<&str>,
        query: ListQuery,
    ) -> Result<Vec<FileMetadata>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<FileMetadata> = inner
            .files
            .iter()
            .filter(|f| {
                f.project_id == project_id
                    && logical_bucket
                        .map(|b| f.logical_bucket == b)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(out, query))
    }

    async fn delete_file_metadata(&self, project_id: ProjectId, object_key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.files.len();
        inner
            .files
            .retain(|f| !(f.project_id == project_id && f.object_key == object_key));
        Ok(inner.files.len() < before)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.inner.lock().await.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(
        &self,
        project_id: Option<ProjectId>,
        query: ListQuery,
    ) -> Result<Vec<AuditEntry>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<AuditEntry> = inner
            .audit
            .iter()
            .filter(|a| project_id.is_none() || a.project_id == project_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(out, query))
    }

    async fn insert_backup(&self, backup: &Backup) -> Result<()> {
        self.inner.lock().await.backups.push(backup.clone());
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        let inner = self.inner.lock().await;
        Ok(inner.backups.iter().find(|b| b.id == id).cloned())
    }

    async fn list_backups(&self, query: BackupQuery) -> Result<Vec<Backup>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Backup> = inner
            .backups
            .iter()
            .filter(|b| {
                query.project_id.map(|p| b.project_id == Some(p)).unwrap_or(true)
                    && query.status.map(|s| b.status == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(
            out,
            ListQuery {
                limit: query.limit.max(1),
                offset: query.offset,
            },
        ))
    }

    async fn mark_backup_running(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(b) = inner.backups.iter_mut().find(|b| b.id == id) {
            if b.status == BackupStatus::Pending {
                b.status = BackupStatus::Running;
            }
        }
        Ok(())
    }

    async fn complete_backup(&self, id: Uuid, size_bytes: i64, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(b) = inner.backups.iter_mut().find(|b| b.id == id) {
            if b.status == BackupStatus::Running {
                b.status = BackupStatus::Completed;
                b.size_bytes = Some(size_bytes);
                b.completed_at = Some(at);
            }
        }
        Ok(())
    }

    async fn fail_backup(&self, id: Uuid, error_message: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(b) = inner.backups.iter_mut().find(|b| b.id == id) {
            b.status = BackupStatus::Failed;
            b.error_message = Some(error_message.to_string());
        }
        Ok(())
    }

    async fn delete_backup(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.backups.len();
        inner.backups.retain(|b| b.id != id);
        Ok(inner.backups.len() < before)
    }

    async fn list_completed_project_backups(&self, project_id: ProjectId) -> Result<Vec<Backup>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Backup> = inner
            .backups
            .iter()
            .filter(|b| {
                b.project_id == Some(project_id)
                    && b.backup_type == BackupType::Project
                    && b.status == BackupStatus::Completed
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn list_expired_backups(&self, now: DateTime<Utc>) -> Result<Vec<Backup>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .backups
            .iter()
            .filter(|b| b.expires_at.map(|e| e < now).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn upsert_cron_job(&self, job: &CronJob) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.cron_jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job.clone();
        } else {
            inner.cron_jobs.push(job.clone());
        }
        Ok(())
    }

    async fn get_cron_job(&self, id: Uuid) -> Result<Option<CronJob>> {
        let inner = self.inner.lock().await;
        Ok(inner.cron_jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_cron_jobs(&self, enabled_only: bool) -> Result<Vec<CronJob>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .cron_jobs
            .iter()
            .filter(|j| !enabled_only || j.enabled)
            .cloned()
            .collect())
    }

    async fn delete_cron_job(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.cron_jobs.len();
        inner.cron_jobs.retain(|j| j.id != id);
        inner.cron_runs.retain(|r| r.job_id != id);
        Ok(inner.cron_jobs.len() < before)
    }

    async fn set_cron_job_runtimes(
        &self,
        id: Uuid,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(j) = inner.cron_jobs.iter_mut().find(|j| j.id == id) {
            if last_run_at.is_some() {
                j.last_run_at = last_run_at;
            }
            if next_run_at.is_some() {
                j.next_run_at = next_run_at;
            }
            j.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_cron_run(&self, run: &CronJobRun) -> Result<()> {
        self.inner.lock().await.cron_runs.push(run.clone());
        Ok(())
    }

    async fn update_cron_run(&self, run: &CronJobRun) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.cron_runs.iter_mut().find(|r| r.id == run.id) {
            *existing = run.clone();
        }
        Ok(())
    }

    async fn list_cron_runs(&self, job_id: Uuid, query: ListQuery) -> Result<Vec<CronJobRun>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<CronJobRun> = inner
            .cron_runs
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(page(out, query))
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .users
            .iter()
            .any(|u| u.email == user.email && u.user_id != user.user_id)
        {
            return Err(Error::Conflict(format!(
                "email '{}' already registered",
                user.email
            )));
        }
        if let Some(existing) = inner.users.iter_mut().find(|u| u.user_id == user.user_id) {
            *existing = user.clone();
        } else {
            inner.users.push(user.clone());
        }
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.iter().find(|u| u.user_id == user_id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.iter().find(|u| u.email == email).cloned())
    }

    async fn list_users(&self, query: ListQuery) -> Result<Vec<UserRecord>> {
        let inner = self.inner.lock().await;
        Ok(page(inner.users.clone(), query))
    }

    async fn delete_user(&self, user_id: UserId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.users.len();
        inner.users.retain(|u| u.user_id != user_id);
        inner.sessions.retain(|s| s.user_id != user_id);
        Ok(inner.users.len() < before)
    }

    async fn insert_invite(&self, invite: &InviteKey) -> Result<()> {
        self.inner.lock().await.invites.push(invite.clone());
        Ok(())
    }

    async fn get_invite_by_hash(&self, token_hash: &str) -> Result<Option<InviteKey>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .invites
            .iter()
            .find(|i| i.token_hash == token_hash)
            .cloned())
    }

    async fn mark_invite_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(i) = inner.invites.iter_mut().find(|i| i.id == id) else {
            return Ok(false);
        };
        if i.used_at.is_some() {
            return Ok(false);
        }
        i.used_at = Some(at);
        Ok(true)
    }

    async fn list_invites(&self, query: ListQuery) -> Result<Vec<InviteKey>> {
        let inner = self.inner.lock().await;
        Ok(page(inner.invites.clone(), query))
    }

    async fn get_session(&self, token_hash: &str) -> Result<Option<SessionRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .iter()
            .find(|s| s.token_hash == token_hash)
            .cloned())
    }

    async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        self.inner.lock().await.sessions.push(session.clone());
        Ok(())
    }

    async fn delete_session(&self, token_hash: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|s| s.token_hash != token_hash);
        Ok(inner.sessions.len() < before)
    }

    async fn load_runtime_settings(&self) -> Result<Option<RuntimeSettings>> {
        Ok(self.inner.lock().await.settings.clone())
    }

    async fn save_runtime_settings(&self, settings: &RuntimeSettings) -> Result<()> {
        self.inner.lock().await.settings = Some(settings.clone());
        Ok(())
    }

    async fn platform_stats(&self, now: DateTime<Utc>) -> Result<PlatformStats> {
        let inner = self.inner.lock().await;
        Ok(PlatformStats {
            projects: inner.projects.len() as i64,
            active_api_keys: inner.api_keys.iter().filter(|k| k.is_active(now)).count() as i64,
            backups_total: inner.backups.len() as i64,
            backups_completed: inner
                .backups
                .iter()
                .filter(|b| b.status == BackupStatus::Completed)
                .count() as i64,
            files: inner.files.len() as i64,
            file_bytes: inner.files.iter().map(|f| f.size_bytes).sum(),
        })
    }
}

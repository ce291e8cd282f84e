//! Backup engine: dump/restore pipelines streamed to the object store,
//! table exports, and the retention sweep.
//!
//! `create` returns as soon as the backup row exists; the dump itself
//! runs on a detached task that walks the row through
//! `pending -> running -> (completed | failed)`.

pub mod export;
pub mod pgtool;
pub mod retention;

use chrono::Utc;
use sqlx::{Column, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::crud;
use crate::models::{
    Backup, BackupFormat, BackupStatus, BackupType, DbPrincipal, ProjectId, UserId,
};
use crate::objects::{BACKUP_BUCKET, ObjectStore};
use crate::store::PlatformDb;
use crate::tenant::TenantRouter;
use crate::{Error, Result};

pub use pgtool::RestoreOutcome;

/// Row cap for table exports.
const TABLE_EXPORT_LIMIT: i64 = 100_000;

#[derive(Debug, Clone)]
pub struct CreateBackupInput {
    pub backup_type: BackupType,
    pub project_id: Option<ProjectId>,
    pub table_name: Option<String>,
    pub format: Option<BackupFormat>,
    pub retention_days: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RetentionSummary {
    pub examined: usize,
    pub deleted: usize,
}

pub struct BackupEngine {
    store: Arc<dyn PlatformDb>,
    objects: Arc<dyn ObjectStore>,
    router: Arc<TenantRouter>,
    platform_db_url: String,
}

impl BackupEngine {
    pub fn new(
        store: Arc<dyn PlatformDb>,
        objects: Arc<dyn ObjectStore>,
        router: Arc<TenantRouter>,
        platform_db_url: String,
    ) -> Self {
        Self {
            store,
            objects,
            router,
            platform_db_url,
        }
    }

    /// Insert a `pending` backup row, kick off the asynchronous run, and
    /// return the row. The HTTP layer answers 202 with it; completion is
    /// observed by polling.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create(
        self: &Arc<Self>,
        input: CreateBackupInput,
        created_by: Option<UserId>,
    ) -> Result<Backup> {
        let backup = self.validate(input, created_by)?;
        self.store.insert_backup(&backup).await?;

        let engine = self.clone();
        let row = backup.clone();
        tokio::spawn(async move {
            engine.run(row).await;
        });
        Ok(backup)
    }

    fn validate(&self, input: CreateBackupInput, created_by: Option<UserId>) -> Result<Backup> {
        let now = Utc::now();
        let ts = now.format("%Y%m%d%H%M%S");
        let (format, object_key) = match input.backup_type {
            BackupType::Platform => {
                let format = input.format.unwrap_or(BackupFormat::Sql);
                if format != BackupFormat::Sql {
                    return Err(Error::BadRequest(
                        "platform backups only support sql format".to_string(),
                    ));
                }
                (format, format!("platform/platform_{ts}.sql"))
            }
            BackupType::Project => {
                let project_id = input.project_id.ok_or_else(|| {
                    Error::BadRequest("project backups require projectId".to_string())
                })?;
                let format = input.format.unwrap_or(BackupFormat::Sql);
                if format != BackupFormat::Sql {
                    return Err(Error::BadRequest(
                        "project backups only support sql format".to_string(),
                    ));
                }
                (format, format!("projects/{project_id}/full_{ts}.sql"))
            }
            BackupType::Table => {
                let project_id = input.project_id.ok_or_else(|| {
                    Error::BadRequest("table backups require projectId".to_string())
                })?;
                let table = input.table_name.as_deref().ok_or_else(|| {
                    Error::BadRequest("table backups require tableName".to_string())
                })?;
                crud::compile::ensure_table_name(table)?;
                let format = input.format.unwrap_or(BackupFormat::Csv);
                if format == BackupFormat::Sql {
                    return Err(Error::BadRequest(
                        "table backups support csv or json format".to_string(),
                    ));
                }
                (
                    format,
                    format!(
                        "projects/{project_id}/tables/{table}_{ts}.{}",
                        format.extension()
                    ),
                )
            }
        };

        Ok(Backup {
            id: Uuid::new_v4(),
            project_id: input.project_id,
            backup_type: input.backup_type,
            table_name: input.table_name,
            object_key,
            size_bytes: None,
            format,
            status: BackupStatus::Pending,
            error_message: None,
            retention_days: input.retention_days,
            expires_at: input
                .retention_days
                .map(|d| now + chrono::Duration::days(d as i64)),
            created_by,
            created_at: now,
            completed_at: None,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, backup))]
    async fn run(&self, backup: Backup) {
        if let Err(e) = self.store.mark_backup_running(backup.id).await {
            tracing::warn!(backup_id = %backup.id, error = %e, "failed marking backup running");
        }

        match self.produce_and_upload(&backup).await {
            Ok(size) => {
                if let Err(e) = self.store.complete_backup(backup.id, size, Utc::now()).await {
                    tracing::warn!(backup_id = %backup.id, error = %e, "failed completing backup");
                } else {
                    tracing::info!(backup_id = %backup.id, size_bytes = size, "backup completed");
                }
            }
            Err(e) => {
                tracing::warn!(backup_id = %backup.id, error = %e, "backup failed");
                if let Err(persist) = self.store.fail_backup(backup.id, &e.to_string()).await {
                    tracing::warn!(backup_id = %backup.id, error = %persist,
                        "failed persisting backup failure");
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, backup))]
    async fn produce_and_upload(&self, backup: &Backup) -> Result<i64> {
        let bytes = match backup.backup_type {
            BackupType::Platform => pgtool::dump_database(&self.platform_db_url).await?,
            BackupType::Project => {
                let project_id = backup
                    .project_id
                    .ok_or_else(|| Error::Internal("project backup without project".to_string()))?;
                let url = self
                    .router
                    .connection_url(project_id, DbPrincipal::Owner)
                    .await?;
                pgtool::dump_database(&url).await?
            }
            BackupType::Table => self.export_table(backup).await?,
        };

        let size = bytes.len() as i64;
        let content_type = match backup.format {
            BackupFormat::Sql => "application/octet-stream",
            BackupFormat::Csv => "text/csv",
            BackupFormat::Json => "application/json",
        };
        self.objects.create_bucket(BACKUP_BUCKET).await?;
        self.objects
            .put(BACKUP_BUCKET, &backup.object_key, bytes.into(), content_type)
            .await?;
        Ok(size)
    }

    #[tracing::instrument(level = "debug", skip(self, backup))]
    async fn export_table(&self, backup: &Backup) -> Result<Vec<u8>> {
        let project_id = backup
            .project_id
            .ok_or_else(|| Error::Internal("table backup without project".to_string()))?;
        let table = backup
            .table_name
            .as_deref()
            .ok_or_else(|| Error::Internal("table backup without table".to_string()))?;
        crud::compile::ensure_table_name(table)?;

        let pool = self.router.pool(project_id, DbPrincipal::Owner).await?;
        let sql = format!("SELECT * FROM \"{table}\" LIMIT {TABLE_EXPORT_LIMIT}");
        let rows = sqlx::query(&sql)
            .fetch_all(&pool)
            .await
            .map_err(|e| Error::backend("table export query", e))?;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let json_rows: Vec<serde_json::Value> = rows
            .iter()
            .map(crud::row_to_json)
            .collect::<Result<_>>()?;

        match backup.format {
            BackupFormat::Csv => Ok(export::rows_to_csv(&columns, &json_rows).into_bytes()),
            BackupFormat::Json => export::rows_to_json(&json_rows),
            BackupFormat::Sql => Err(Error::Internal(
                "table backup cannot use sql format".to_string(),
            )),
        }
    }

    /// Restore a completed project backup into its tenant database.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore(&self, backup_id: Uuid) -> Result<RestoreOutcome> {
        let backup = self
            .store
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("backup {backup_id}")))?;
        if backup.backup_type != BackupType::Project || backup.format != BackupFormat::Sql {
            return Err(Error::BadRequest(
                "only project sql backups can be restored".to_string(),
            ));
        }
        if backup.status != BackupStatus::Completed {
            return Err(Error::BadRequest(format!(
                "backup is {}, not completed",
                backup.status.as_str()
            )));
        }
        let project_id = backup
            .project_id
            .ok_or_else(|| Error::Internal("project backup without project".to_string()))?;

        let dump = self
            .objects
            .get(BACKUP_BUCKET, &backup.object_key)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("backup object '{}'", backup.object_key))
            })?;

        let url = self
            .router
            .connection_url(project_id, DbPrincipal::Owner)
            .await?;
        let outcome = pgtool::restore_database(&url, &dump).await?;
        tracing::info!(backup_id = %backup_id, project_id = %project_id,
            warnings = outcome.warnings.len(), "backup restored");
        Ok(outcome)
    }

    /// Presigned download URL for a completed backup object.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn download_url(&self, backup_id: Uuid) -> Result<String> {
        let backup = self
            .store
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("backup {backup_id}")))?;
        if backup.status != BackupStatus::Completed {
            return Err(Error::BadRequest(format!(
                "backup is {}, not completed",
                backup.status.as_str()
            )));
        }
        self.objects
            .presign_get(
                BACKUP_BUCKET,
                &backup.object_key,
                std::time::Duration::from_secs(3600),
            )
            .await
    }

    /// Apply the tiered retention policy, for one project or all of them.
    /// Object deletions are best-effort; the row deletion wins.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn run_retention(&self, project_id: Option<ProjectId>) -> Result<RetentionSummary> {
        let projects: Vec<ProjectId> = match project_id {
            Some(id) => vec![id],
            None => {
                let mut ids = Vec::new();
                let mut offset = 0usize;
                loop {
                    let page = self
                        .store
                        .list_projects(crate::models::ListQuery { limit: 500, offset })
                        .await?;
                    if page.is_empty() {
                        break;
                    }
                    offset += page.len();
                    ids.extend(page.into_iter().map(|p| p.id));
                }
                ids
            }
        };

        let now = Utc::now();
        let mut summary = RetentionSummary::default();
        for project in projects {
            let backups = self.store.list_completed_project_backups(project).await?;
            summary.examined += backups.len();
            let deletions = retention::plan_deletions(&backups, now);
            for id in deletions {
                let Some(backup) = backups.iter().find(|b| b.id == id) else {
                    continue;
                };
                self.delete_backup_and_object(backup).await;
                summary.deleted += 1;
            }
        }
        tracing::info!(examined = summary.examined, deleted = summary.deleted,
            "retention sweep finished");
        Ok(summary)
    }

    /// Orthogonal legacy cleanup: rows whose `expires_at` passed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let expired = self.store.list_expired_backups(Utc::now()).await?;
        let mut deleted = 0usize;
        for backup in &expired {
            self.delete_backup_and_object(backup).await;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Delete an admin-selected backup row plus its object.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete(&self, backup_id: Uuid) -> Result<()> {
        let backup = self
            .store
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("backup {backup_id}")))?;
        self.delete_backup_and_object(&backup).await;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, backup))]
    async fn delete_backup_and_object(&self, backup: &Backup) {
        if let Err(e) = self.objects.delete(BACKUP_BUCKET, &backup.object_key).await {
            tracing::warn!(backup_id = %backup.id, object_key = %backup.object_key, error = %e,
                "backup object deletion failed; row deletion proceeds");
        }
        if let Err(e) = self.store.delete_backup(backup.id).await {
            tracing::warn!(backup_id = %backup.id, error = %e, "backup row deletion failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoService;
    use crate::store::MemoryPlatformDb;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    /// In-memory object store; `fail_deletes` simulates a flaky backend.
    #[derive(Default)]
    struct MemObjectStore {
        objects: Mutex<HashMap<(String, String), Bytes>>,
        fail_deletes: bool,
    }

    #[async_trait]
    impl ObjectStore for MemObjectStore {
        async fn create_bucket(&self, _bucket: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_bucket(&self, _bucket: &str) -> Result<()> {
            Ok(())
        }
        async fn put(&self, bucket: &str, key: &str, data: Bytes, _ct: &str) -> Result<()> {
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), data);
            Ok(())
        }
        async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned())
        }
        async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
            if self.fail_deletes {
                return Err(Error::BackendMessage("delete refused".to_string()));
            }
            self.objects
                .lock()
                .unwrap()
                .remove(&(bucket.to_string(), key.to_string()));
            Ok(())
        }
        async fn list(&self, bucket: &str, prefix: &str, limit: usize) -> Result<Vec<crate::objects::ObjectInfo>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
                .take(limit)
                .map(|((_, k), v)| crate::objects::ObjectInfo {
                    key: k.clone(),
                    size: v.len() as i64,
                })
                .collect())
        }
        async fn presign_put(&self, _b: &str, _k: &str, _ct: &str, _e: StdDuration) -> Result<String> {
            Ok("http://presigned.put".to_string())
        }
        async fn presign_get(&self, _b: &str, _k: &str, _e: StdDuration) -> Result<String> {
            Ok("http://presigned.get".to_string())
        }
    }

    fn engine_with(objects: Arc<MemObjectStore>) -> (Arc<BackupEngine>, Arc<MemoryPlatformDb>) {
        let store = Arc::new(MemoryPlatformDb::new());
        let router = Arc::new(TenantRouter::new(
            store.clone(),
            CryptoService::new(&[1u8; 32]),
        ));
        let engine = Arc::new(BackupEngine::new(
            store.clone(),
            objects,
            router,
            "postgres://platform".to_string(),
        ));
        (engine, store)
    }

    fn completed_backup(project: ProjectId, age_days: i64) -> Backup {
        let created_at = Utc::now() - chrono::Duration::days(age_days);
        Backup {
            id: Uuid::new_v4(),
            project_id: Some(project),
            backup_type: BackupType::Project,
            table_name: None,
            object_key: format!("projects/{project}/full_{age_days}.sql"),
            size_bytes: Some(10),
            format: BackupFormat::Sql,
            status: BackupStatus::Completed,
            error_message: None,
            retention_days: None,
            expires_at: None,
            created_by: None,
            created_at,
            completed_at: Some(created_at),
        }
    }

    #[tokio::test]
    async fn create_validates_type_constraints() {
        let (engine, _) = engine_with(Arc::new(MemObjectStore::default()));
        let err = engine
            .create(
                CreateBackupInput {
                    backup_type: BackupType::Project,
                    project_id: None,
                    table_name: None,
                    format: None,
                    retention_days: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let err = engine
            .create(
                CreateBackupInput {
                    backup_type: BackupType::Table,
                    project_id: Some(ProjectId::new()),
                    table_name: None,
                    format: None,
                    retention_days: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn create_derives_typed_object_keys() {
        let (engine, store) = engine_with(Arc::new(MemObjectStore::default()));
        let project = ProjectId::new();
        let backup = engine
            .create(
                CreateBackupInput {
                    backup_type: BackupType::Table,
                    project_id: Some(project),
                    table_name: Some("users".to_string()),
                    format: Some(BackupFormat::Json),
                    retention_days: Some(7),
                },
                None,
            )
            .await
            .unwrap();
        assert!(backup
            .object_key
            .starts_with(&format!("projects/{project}/tables/users_")));
        assert!(backup.object_key.ends_with(".json"));
        assert!(backup.expires_at.is_some());
        // The row is visible immediately at pending/running.
        let stored = store.get_backup(backup.id).await.unwrap().unwrap();
        assert!(matches!(
            stored.status,
            BackupStatus::Pending | BackupStatus::Running | BackupStatus::Failed
        ));
    }

    #[tokio::test]
    async fn retention_sweep_deletes_rows_even_when_object_delete_fails() {
        let objects = Arc::new(MemObjectStore {
            fail_deletes: true,
            ..Default::default()
        });
        let (engine, store) = engine_with(objects);
        let project = ProjectId::new();
        let now = Utc::now();
        store
            .insert_project(&crate::models::Project {
                id: project,
                name: "p".to_string(),
                slug: "p".to_string(),
                description: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        for age in [0, 2, 4, 5, 9, 20] {
            store
                .insert_backup(&completed_backup(project, age))
                .await
                .unwrap();
        }

        let summary = engine.run_retention(None).await.unwrap();
        assert_eq!(summary.examined, 6);
        assert_eq!(summary.deleted, 2);

        let remaining = store.list_completed_project_backups(project).await.unwrap();
        assert_eq!(remaining.len(), 4);
    }

    #[tokio::test]
    async fn expired_cleanup_is_orthogonal() {
        let (engine, store) = engine_with(Arc::new(MemObjectStore::default()));
        let project = ProjectId::new();
        let mut expired = completed_backup(project, 1);
        expired.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.insert_backup(&expired).await.unwrap();
        let mut alive = completed_backup(project, 1);
        alive.expires_at = Some(Utc::now() + chrono::Duration::days(1));
        store.insert_backup(&alive).await.unwrap();

        let deleted = engine.cleanup_expired().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_backup(expired.id).await.unwrap().is_none());
        assert!(store.get_backup(alive.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn restore_rejects_non_project_or_incomplete() {
        let (engine, store) = engine_with(Arc::new(MemObjectStore::default()));
        let project = ProjectId::new();
        let mut pending = completed_backup(project, 0);
        pending.status = BackupStatus::Pending;
        store.insert_backup(&pending).await.unwrap();
        assert!(matches!(
            engine.restore(pending.id).await,
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            engine.restore(Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        ));
    }
}

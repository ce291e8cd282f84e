//! Built-in platform actions runnable as cron jobs.

use async_trait::async_trait;
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;

use crate::backup::{BackupEngine, CreateBackupInput};
use crate::models::{BackupType, CronJob, ListQuery, DbPrincipal, ProjectId};
use crate::store::PlatformDb;
use crate::tenant::TenantRouter;
use crate::{Error, Result};

/// Sink for scheduler failure events and status notifications. Wired in
/// by the host; absent means failures are only logged.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_job_failure(&self, job: &CronJob, attempts: i32, last_error: &str);
    async fn notify_status(&self, message: &str);
}

/// Default sink: structured log lines.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_job_failure(&self, job: &CronJob, attempts: i32, last_error: &str) {
        tracing::error!(job_id = %job.id, job_name = %job.name, attempts,
            error = %last_error, "cron job failed all attempts");
    }

    async fn notify_status(&self, message: &str) {
        tracing::info!(status = %message, "platform status");
    }
}

pub struct PlatformActions {
    store: Arc<dyn PlatformDb>,
    backup: Arc<BackupEngine>,
    router: Arc<TenantRouter>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl PlatformActions {
    pub fn new(
        store: Arc<dyn PlatformDb>,
        backup: Arc<BackupEngine>,
        router: Arc<TenantRouter>,
        notifier: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        Self {
            store,
            backup,
            router,
            notifier,
        }
    }

    /// Run a named action. Unknown names fail the dispatch.
    #[tracing::instrument(level = "debug", skip(self, config))]
    pub async fn run(
        &self,
        action: &str,
        config: Option<&serde_json::Value>,
        job_project: Option<ProjectId>,
    ) -> Result<String> {
        let project = config_project(config)?.or(job_project);
        match action {
            "backup_project" => {
                let project = project.ok_or_else(|| {
                    Error::BadRequest("backup_project requires a projectId".to_string())
                })?;
                let retention_days = config
                    .and_then(|c| c.get("retentionDays"))
                    .and_then(|v| v.as_i64())
                    .map(|d| d as i32);
                let backup = self
                    .backup
                    .create(
                        CreateBackupInput {
                            backup_type: BackupType::Project,
                            project_id: Some(project),
                            table_name: None,
                            format: None,
                            retention_days,
                        },
                        None,
                    )
                    .await?;
                Ok(format!("started backup {} for project {project}", backup.id))
            }
            "backup_all_projects" => {
                let mut started = 0usize;
                for project in self.all_projects().await? {
                    match self
                        .backup
                        .create(
                            CreateBackupInput {
                                backup_type: BackupType::Project,
                                project_id: Some(project),
                                table_name: None,
                                format: None,
                                retention_days: None,
                            },
                            None,
                        )
                        .await
                    {
                        Ok(_) => started += 1,
                        Err(e) => {
                            tracing::warn!(project_id = %project, error = %e,
                                "failed starting project backup");
                        }
                    }
                }
                Ok(format!("started {started} project backups"))
            }
            "cleanup_backups_with_retention" => {
                let summary = self.backup.run_retention(project).await?;
                Ok(format!(
                    "retention examined {} backups, deleted {}",
                    summary.examined, summary.deleted
                ))
            }
            "cleanup_expired_backups" => {
                let deleted = self.backup.cleanup_expired().await?;
                Ok(format!("deleted {deleted} expired backups"))
            }
            "vacuum_database" => self.vacuum_all().await,
            "notify_status" => {
                let stats = self.store.platform_stats(Utc::now()).await?;
                let message = format!(
                    "projects={} active_keys={} backups={}/{} files={} bytes={}",
                    stats.projects,
                    stats.active_api_keys,
                    stats.backups_completed,
                    stats.backups_total,
                    stats.files,
                    stats.file_bytes
                );
                if let Some(notifier) = &self.notifier {
                    notifier.notify_status(&message).await;
                }
                Ok(message)
            }
            other => Err(Error::BadRequest(format!(
                "unknown platform action '{other}'"
            ))),
        }
    }

    /// VACUUM ANALYZE every tenant database through a one-connection pool.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn vacuum_all(&self) -> Result<String> {
        let mut ok = 0usize;
        let mut failed = 0usize;
        for project in self.all_projects().await? {
            let result: Result<()> = async {
                let url = self
                    .router
                    .connection_url(project, DbPrincipal::Owner)
                    .await?;
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(1)
                    .connect(&url)
                    .await
                    .map_err(|e| Error::backend("connect for vacuum", e))?;
                let outcome = sqlx::query("VACUUM ANALYZE")
                    .execute(&pool)
                    .await
                    .map(|_| ())
                    .map_err(|e| Error::backend("vacuum analyze", e));
                pool.close().await;
                outcome
            }
            .await;
            match result {
                Ok(()) => ok += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(project_id = %project, error = %e, "vacuum failed");
                }
            }
        }
        Ok(format!("vacuumed {ok} tenant databases ({failed} failed)"))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn all_projects(&self) -> Result<Vec<ProjectId>> {
        let mut ids = Vec::new();
        let mut offset = 0usize;
        loop {
            let page = self
                .store
                .list_projects(ListQuery { limit: 500, offset })
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            ids.extend(page.into_iter().map(|p| p.id));
        }
        Ok(ids)
    }
}

fn config_project(config: Option<&serde_json::Value>) -> Result<Option<ProjectId>> {
    let Some(value) = config.and_then(|c| c.get("projectId")) else {
        return Ok(None);
    };
    let raw = value
        .as_str()
        .ok_or_else(|| Error::BadRequest("projectId must be a string".to_string()))?;
    ProjectId::from_str(raw)
        .map(Some)
        .map_err(|e| Error::BadRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoService;
    use crate::store::MemoryPlatformDb;

    fn actions() -> PlatformActions {
        let store: Arc<dyn PlatformDb> = Arc::new(MemoryPlatformDb::new());
        let router = Arc::new(TenantRouter::new(
            store.clone(),
            CryptoService::new(&[2u8; 32]),
        ));
        let backup = Arc::new(BackupEngine::new(
            store.clone(),
            Arc::new(crate::objects::testing::NullObjectStore),
            router.clone(),
            "postgres://platform".to_string(),
        ));
        PlatformActions::new(store, backup, router, None)
    }

    #[tokio::test]
    async fn unknown_action_fails_descriptively() {
        let err = actions().run("defrag_tapes", None, None).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(msg) if msg.contains("defrag_tapes")));
    }

    #[tokio::test]
    async fn backup_project_requires_project() {
        let err = actions().run("backup_project", None, None).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn project_id_comes_from_config_or_job() {
        let config = serde_json::json!({ "projectId": "not-a-uuid" });
        let err = actions()
            .run("cleanup_backups_with_retention", Some(&config), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}

use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::crypto::{self, CryptoService};
use crate::models::{
    ApiKeyType, AuditEntry, DbPrincipal, LogicalBucket, Project, ProjectCredential, ProjectId,
    UserId,
};
use crate::keys::ApiKeyService;
use crate::objects::StorageBroker;
use crate::store::PlatformDb;
use crate::tenant::TenantRouter;
use crate::{Error, Result};

/// Logical buckets every new project starts with.
const DEFAULT_BUCKETS: [&str; 2] = ["private", "uploads"];

#[derive(Debug, Clone)]
pub struct CreateProjectInput {
    pub name: String,
    pub description: Option<String>,
}

/// Result of provisioning. The two plaintext keys appear here and nowhere
/// else, ever again.
#[derive(Debug, Clone)]
pub struct CreatedProject {
    pub project: Project,
    pub publishable_key: String,
    pub secret_key: String,
}

/// Orchestrates tenant creation and teardown.
///
/// DDL (CREATE/DROP DATABASE and ROLE) runs against the platform server
/// outside any transaction; the metadata rows land in a single store
/// transaction afterwards. On any failure the DDL is rolled back with
/// idempotent `DROP ... IF EXISTS` statements.
pub struct Provisioner {
    admin_pool: PgPool,
    db_cfg: DatabaseConfig,
    store: Arc<dyn PlatformDb>,
    crypto: CryptoService,
    broker: Arc<StorageBroker>,
    router: Arc<TenantRouter>,
}

impl Provisioner {
    pub fn new(
        admin_pool: PgPool,
        db_cfg: DatabaseConfig,
        store: Arc<dyn PlatformDb>,
        crypto: CryptoService,
        broker: Arc<StorageBroker>,
        router: Arc<TenantRouter>,
    ) -> Self {
        Self {
            admin_pool,
            db_cfg,
            store,
            crypto,
            broker,
            router,
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create(
        &self,
        input: CreateProjectInput,
        created_by: Option<UserId>,
    ) -> Result<CreatedProject> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::BadRequest("project name is empty".to_string()));
        }

        let id = ProjectId::new();
        let names = TenantNames::derive(id);
        let slug = self.unique_slug(&name, id).await?;

        let owner_password = crypto::generate_role_password();
        let app_password = crypto::generate_role_password();

        match self
            .create_inner(id, &names, &owner_password, &app_password)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                self.cleanup_ddl(&names).await;
                return Err(e);
            }
        }

        let now = Utc::now();
        let project = Project {
            id,
            name: name.clone(),
            slug,
            description: input.description.clone(),
            created_at: now,
            updated_at: now,
        };

        let owner_cred = ProjectCredential {
            project_id: id,
            principal: DbPrincipal::Owner,
            payload: self
                .crypto
                .encrypt_str(&self.role_url(&names.database, &names.owner_role, &owner_password))?,
            created_at: now,
        };
        let app_cred = ProjectCredential {
            project_id: id,
            principal: DbPrincipal::App,
            payload: self
                .crypto
                .encrypt_str(&self.role_url(&names.database, &names.app_role, &app_password))?,
            created_at: now,
        };

        let publishable = ApiKeyService::mint(id, ApiKeyType::Publishable, None);
        let secret = ApiKeyService::mint(id, ApiKeyType::Secret, None);

        let buckets: Vec<LogicalBucket> = DEFAULT_BUCKETS
            .iter()
            .map(|b| LogicalBucket {
                id: Uuid::new_v4(),
                project_id: id,
                name: b.to_string(),
                created_at: now,
            })
            .collect();

        let records = self
            .store
            .provision_project_records(
                &project,
                &[owner_cred, app_cred],
                &[publishable.key.clone(), secret.key.clone()],
                &buckets,
            )
            .await;
        if let Err(e) = records {
            self.cleanup_ddl(&names).await;
            return Err(e);
        }

        if let Err(e) = self.broker.create_project_namespace(id).await {
            self.cleanup_ddl(&names).await;
            let _ = self.store.delete_project_cascade(id).await;
            return Err(e);
        }

        self.audit(
            Some(id),
            created_by,
            "project.created",
            serde_json::json!({ "name": project.name, "slug": project.slug }),
        )
        .await;
        tracing::info!(project_id = %id, slug = %project.slug, "project provisioned");

        Ok(CreatedProject {
            project,
            publishable_key: publishable.plaintext,
            secret_key: secret.plaintext,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, names, owner_password, app_password))]
    async fn create_inner(
        &self,
        id: ProjectId,
        names: &TenantNames,
        owner_password: &str,
        app_password: &str,
    ) -> Result<()> {
        // CREATE DATABASE cannot run inside a transaction; each statement
        // here executes on its own connection from the admin pool.
        self.exec_admin(&format!("CREATE DATABASE \"{}\"", names.database))
            .await?;
        self.exec_admin(&format!(
            "CREATE ROLE \"{}\" WITH LOGIN PASSWORD '{}'",
            names.owner_role, owner_password
        ))
        .await?;
        self.exec_admin(&format!(
            "CREATE ROLE \"{}\" WITH LOGIN PASSWORD '{}'",
            names.app_role, app_password
        ))
        .await?;
        self.exec_admin(&format!(
            "GRANT ALL PRIVILEGES ON DATABASE \"{}\" TO \"{}\"",
            names.database, names.owner_role
        ))
        .await?;
        self.exec_admin(&format!(
            "GRANT CONNECT ON DATABASE \"{}\" TO \"{}\"",
            names.database, names.app_role
        ))
        .await?;

        // Schema-level grants require a connection to the new database.
        let tenant_pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.db_cfg.url_for(&names.database))
            .await
            .map_err(|e| Error::backend("connect new tenant db", e))?;
        let result = self.grant_schema_privileges(&tenant_pool, names).await;
        tenant_pool.close().await;
        result?;

        tracing::debug!(project_id = %id, database = %names.database, "tenant database created");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, pool, names))]
    async fn grant_schema_privileges(&self, pool: &PgPool, names: &TenantNames) -> Result<()> {
        for stmt in [
            format!(
                "GRANT ALL ON SCHEMA public TO \"{}\"",
                names.owner_role
            ),
            format!(
                "ALTER DEFAULT PRIVILEGES FOR ROLE \"{}\" IN SCHEMA public \
                 GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO \"{}\"",
                names.owner_role, names.app_role
            ),
            format!(
                "ALTER DEFAULT PRIVILEGES FOR ROLE \"{}\" IN SCHEMA public \
                 GRANT USAGE, SELECT ON SEQUENCES TO \"{}\"",
                names.owner_role, names.app_role
            ),
        ] {
            sqlx::query(&stmt)
                .execute(pool)
                .await
                .map_err(|e| Error::backend("grant schema privileges", e))?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete(&self, id: ProjectId, deleted_by: Option<UserId>) -> Result<()> {
        let project = self
            .store
            .get_project(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {id}")))?;
        let names = TenantNames::derive(id);

        self.router.close(id).await;
        self.store.delete_project_cascade(id).await?;

        // Infrastructure teardown is best-effort: the metadata is already
        // gone, so failures are logged and audited rather than re-raised.
        self.cleanup_ddl(&names).await;
        if let Err(e) = self.broker.destroy_project_namespace(id).await {
            tracing::warn!(project_id = %id, error = %e, "failed deleting project bucket");
            self.audit(
                Some(id),
                deleted_by,
                "project.delete.bucket_failed",
                serde_json::json!({ "error": e.to_string() }),
            )
            .await;
        }

        self.audit(
            Some(id),
            deleted_by,
            "project.deleted",
            serde_json::json!({ "name": project.name, "slug": project.slug }),
        )
        .await;
        tracing::info!(project_id = %id, "project deleted");
        Ok(())
    }

    /// Idempotent DDL rollback, used both for create-failure compensation
    /// and for delete. Errors are logged, never raised.
    #[tracing::instrument(level = "debug", skip(self, names))]
    async fn cleanup_ddl(&self, names: &TenantNames) {
        for stmt in [
            format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", names.database),
            format!("DROP ROLE IF EXISTS \"{}\"", names.owner_role),
            format!("DROP ROLE IF EXISTS \"{}\"", names.app_role),
        ] {
            if let Err(e) = sqlx::query(&stmt).execute(&self.admin_pool).await {
                tracing::warn!(statement = %stmt, error = %e, "tenant ddl cleanup failed");
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, sql))]
    async fn exec_admin(&self, sql: &str) -> Result<()> {
        sqlx::query(sql)
            .execute(&self.admin_pool)
            .await
            .map_err(|e| Error::backend("tenant ddl", e))?;
        Ok(())
    }

    fn role_url(&self, database: &str, role: &str, password: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            role, password, self.db_cfg.host, self.db_cfg.port, database
        )
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn unique_slug(&self, name: &str, id: ProjectId) -> Result<String> {
        let base = slugify(name);
        if self.store.get_project_by_slug(&base).await?.is_none() {
            return Ok(base);
        }
        Ok(format!("{}-{}", base, &id.compact()[..8]))
    }

    #[tracing::instrument(level = "debug", skip(self, details))]
    async fn audit(
        &self,
        project_id: Option<ProjectId>,
        user_id: Option<UserId>,
        action: &str,
        details: serde_json::Value,
    ) {
        let entry = AuditEntry::new(project_id, user_id, action, details);
        if let Err(e) = self.store.append_audit(&entry).await {
            tracing::warn!(action = %entry.action, error = %e, "audit write failed");
        }
    }
}

/// Deterministic tenant object names derived from the project id.
struct TenantNames {
    database: String,
    owner_role: String,
    app_role: String,
}

impl TenantNames {
    fn derive(id: ProjectId) -> Self {
        let database = format!("proj_{}", id.compact());
        Self {
            owner_role: format!("{database}_owner"),
            app_role: format!("{database}_app"),
            database,
        }
    }
}

fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_names_are_deterministic() {
        let id = ProjectId::new();
        let a = TenantNames::derive(id);
        let b = TenantNames::derive(id);
        assert_eq!(a.database, b.database);
        assert!(a.database.starts_with("proj_"));
        assert!(!a.database.contains('-'));
        assert_eq!(a.owner_role, format!("{}_owner", a.database));
        assert_eq!(a.app_role, format!("{}_app", a.database));
    }

    #[test]
    fn slugify_normalizes() {
        assert_eq!(slugify("My Cool App"), "my-cool-app");
        assert_eq!(slugify("  spaced   out  "), "spaced-out");
        assert_eq!(slugify("___"), "project");
        assert_eq!(slugify("Already-Fine"), "already-fine");
    }
}

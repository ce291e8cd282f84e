use dashmap::DashMap;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::CryptoService;
use crate::models::{DbPrincipal, ProjectId};
use crate::store::PlatformDb;
use crate::{Error, Result};

/// Per-tier connection cap. Small on purpose: a runaway tenant must not
/// starve the rest of the server's connections.
const POOL_MAX_PER_TIER: u32 = 3;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct TenantPools {
    owner: PgPool,
    app: PgPool,
}

/// Cache of per-project connection pools at two privilege tiers.
///
/// Pools are built lazily on first access by decrypting the project's two
/// credential rows. All tenant database access goes through here; callers
/// name the privilege tier explicitly.
pub struct TenantRouter {
    store: Arc<dyn PlatformDb>,
    crypto: CryptoService,
    pools: DashMap<ProjectId, TenantPools>,
}

impl TenantRouter {
    pub fn new(store: Arc<dyn PlatformDb>, crypto: CryptoService) -> Self {
        Self {
            store,
            crypto,
            pools: DashMap::new(),
        }
    }

    /// Pool for `(project, principal)`, building both tiers on a miss.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn pool(&self, project_id: ProjectId, principal: DbPrincipal) -> Result<PgPool> {
        if let Some(entry) = self.pools.get(&project_id) {
            return Ok(match principal {
                DbPrincipal::Owner => entry.owner.clone(),
                DbPrincipal::App => entry.app.clone(),
            });
        }

        let built = self.build_pools(project_id).await?;
        // A concurrent caller may have built the same entry; keep whichever
        // landed first and let the loser's pools drop.
        let entry = self.pools.entry(project_id).or_insert(built);
        Ok(match principal {
            DbPrincipal::Owner => entry.owner.clone(),
            DbPrincipal::App => entry.app.clone(),
        })
    }

    /// Decrypted connection URL for a principal. Only the backup engine
    /// uses this, to hand the descriptor to `pg_dump`/`pg_restore`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn connection_url(
        &self,
        project_id: ProjectId,
        principal: DbPrincipal,
    ) -> Result<String> {
        let cred = self
            .store
            .get_credential(project_id, principal)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "{} credential for project {project_id}",
                    principal.as_str()
                ))
            })?;
        self.crypto.decrypt_str(&cred.payload)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn build_pools(&self, project_id: ProjectId) -> Result<TenantPools> {
        let owner_url = self.connection_url(project_id, DbPrincipal::Owner).await?;
        let app_url = self.connection_url(project_id, DbPrincipal::App).await?;

        let owner = Self::open(&owner_url, "owner").await?;
        let app = match Self::open(&app_url, "app").await {
            Ok(p) => p,
            Err(e) => {
                owner.close().await;
                return Err(e);
            }
        };
        tracing::debug!(project_id = %project_id, "opened tenant pools");
        Ok(TenantPools { owner, app })
    }

    #[tracing::instrument(level = "debug", skip(url))]
    async fn open(url: &str, tier: &str) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(POOL_MAX_PER_TIER)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| Error::backend(format!("connect tenant {tier} pool"), e))
    }

    /// Drain and drop both pools for a project. Used on project deletion.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn close(&self, project_id: ProjectId) {
        if let Some((_, pools)) = self.pools.remove(&project_id) {
            pools.owner.close().await;
            pools.app.close().await;
            tracing::debug!(project_id = %project_id, "closed tenant pools");
        }
    }

    /// Drain every cached pool. Called on shutdown.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn close_all(&self) {
        let ids: Vec<ProjectId> = self.pools.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close(id).await;
        }
    }
}

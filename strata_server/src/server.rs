use axum::routing::get;
use axum::{Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use strata_core::backup::BackupEngine;
use strata_core::config::{PlatformConfig, SettingsHandle};
use strata_core::crud::{CrudExecutor, SchemaCache};
use strata_core::crypto::CryptoService;
use strata_core::keys::ApiKeyService;
use strata_core::objects::{S3ObjectStore, StorageBroker};
use strata_core::scheduler::{
    HttpPlatformRunner, LogNotifier, NotificationSink, PlatformActions, Scheduler,
};
use strata_core::sqlexec::SqlExecutor;
use strata_core::store::{PlatformDb, PostgresPlatformDb};
use strata_core::tenant::{Provisioner, TenantRouter};

use crate::auth::{SessionAuthExt, StoreSessionAuth};
use crate::{admin, routes};

pub struct AppState {
    pub store: Arc<dyn PlatformDb>,
    pub crypto: CryptoService,
    pub settings: SettingsHandle,
    pub tenants: Arc<TenantRouter>,
    pub provisioner: Arc<Provisioner>,
    pub keys: Arc<ApiKeyService>,
    pub crud: Arc<CrudExecutor>,
    pub sqlexec: Arc<SqlExecutor>,
    pub broker: Arc<StorageBroker>,
    pub backups: Arc<BackupEngine>,
    pub scheduler: Scheduler,
    pub started_at: Instant,
}

/// Wire every component from configuration. The platform schema is
/// migrated here so `serve` starts against a current database.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn build_state(cfg: &PlatformConfig) -> anyhow::Result<AppState> {
    let crypto = CryptoService::from_secret(&cfg.master_key_secret)?;

    let platform_db = PostgresPlatformDb::connect(&cfg.database).await?;
    platform_db.migrate().await?;
    let admin_pool = platform_db.pool().clone();
    let store: Arc<dyn PlatformDb> = Arc::new(platform_db);

    // Persisted runtime settings override the env-derived defaults.
    let settings = SettingsHandle::new(match store.load_runtime_settings().await? {
        Some(persisted) => persisted,
        None => cfg.settings.clone(),
    });

    let objects = Arc::new(S3ObjectStore::new(&cfg.object_store).await?);
    let broker = Arc::new(StorageBroker::new(
        store.clone(),
        objects.clone(),
        cfg.presigned_url_expiry,
        cfg.max_upload_size_bytes,
    ));

    let tenants = Arc::new(TenantRouter::new(store.clone(), crypto.clone()));
    let schema = Arc::new(SchemaCache::new(tenants.clone()));
    let keys = Arc::new(ApiKeyService::new(store.clone()));
    let crud = Arc::new(CrudExecutor::new(
        tenants.clone(),
        schema.clone(),
        settings.clone(),
    ));
    let sqlexec = Arc::new(SqlExecutor::new(
        tenants.clone(),
        schema.clone(),
        settings.clone(),
    ));
    let provisioner = Arc::new(Provisioner::new(
        admin_pool,
        cfg.database.clone(),
        store.clone(),
        crypto.clone(),
        broker.clone(),
        tenants.clone(),
    ));
    let backups = Arc::new(BackupEngine::new(
        store.clone(),
        objects,
        tenants.clone(),
        cfg.database.url(),
    ));

    let notifier: Arc<dyn NotificationSink> = Arc::new(LogNotifier);
    let actions = Arc::new(PlatformActions::new(
        store.clone(),
        backups.clone(),
        tenants.clone(),
        Some(notifier.clone()),
    ));
    let runner = Arc::new(HttpPlatformRunner::new(
        crypto.clone(),
        actions,
        cfg.scheduler.default_timeout_ms,
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        runner,
        Some(notifier),
        cfg.scheduler.clone(),
    );

    Ok(AppState {
        store,
        crypto,
        settings,
        tenants,
        provisioner,
        keys,
        crud,
        sqlexec,
        broker,
        backups,
        scheduler,
        started_at: Instant::now(),
    })
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(state: Arc<AppState>) -> Router {
    let session_auth = SessionAuthExt(Arc::new(StoreSessionAuth::new(state.store.clone())));

    Router::new()
        .merge(routes::router())
        .merge(admin::router())
        .route("/health", get(routes::health::get_health))
        .layer(Extension(state))
        .layer(Extension(session_auth))
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let state = Arc::new(state);

    // The scheduler shares the process with request serving; its arms fire
    // independently of inbound traffic.
    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        scheduler.run_loop().await;
    });

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "strata listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.scheduler.shutdown();
    state.tenants.close_all().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

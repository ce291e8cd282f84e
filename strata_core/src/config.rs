use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_max: u32,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl DatabaseConfig {
    /// Connection URL for the platform database.
    pub fn url(&self) -> String {
        self.url_for(&self.database)
    }

    /// Connection URL for an arbitrary database on the same server, using
    /// the platform superuser. The provisioner uses this to run DDL against
    /// freshly created tenant databases.
    pub fn url_for(&self, database: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, database
        )
    }
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub port: u16,
    pub use_ssl: bool,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl ObjectStoreConfig {
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.endpoint, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub default_timeout_ms: i64,
    pub max_concurrent_jobs: usize,
}

/// Static process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub database: DatabaseConfig,
    pub object_store: ObjectStoreConfig,
    pub master_key_secret: String,
    pub scheduler: SchedulerConfig,
    pub presigned_url_expiry: Duration,
    pub max_upload_size_bytes: i64,
    pub settings: RuntimeSettings,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::BadRequest(format!("{key} is required")))
}

impl PlatformConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let database = DatabaseConfig {
            host: env_or("STRATA_DB_HOST", "localhost".to_string()),
            port: env_or("STRATA_DB_PORT", 5432u16),
            database: env_or("STRATA_DB_NAME", "strata".to_string()),
            user: env_or("STRATA_DB_USER", "postgres".to_string()),
            password: required("STRATA_DB_PASSWORD")?,
            pool_max: env_or("STRATA_DB_POOL_MAX", 10u32),
            idle_timeout: Duration::from_millis(env_or("STRATA_DB_IDLE_TIMEOUT_MS", 30_000u64)),
            connect_timeout: Duration::from_millis(env_or(
                "STRATA_DB_CONNECT_TIMEOUT_MS",
                5_000u64,
            )),
        };

        let object_store = ObjectStoreConfig {
            endpoint: env_or("STRATA_S3_ENDPOINT", "localhost".to_string()),
            port: env_or("STRATA_S3_PORT", 9000u16),
            use_ssl: env_or("STRATA_S3_USE_SSL", false),
            region: env_or("STRATA_S3_REGION", "us-east-1".to_string()),
            access_key: required("STRATA_S3_ACCESS_KEY")?,
            secret_key: required("STRATA_S3_SECRET_KEY")?,
        };

        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_millis(env_or(
                "STRATA_SCHEDULER_POLL_INTERVAL_MS",
                60_000u64,
            )),
            default_timeout_ms: env_or("STRATA_SCHEDULER_DEFAULT_TIMEOUT_MS", 30_000i64),
            max_concurrent_jobs: env_or("STRATA_SCHEDULER_MAX_CONCURRENT_JOBS", 10usize),
        };

        let settings = RuntimeSettings {
            rate_limit_max: env_or("STRATA_RATE_LIMIT_MAX", 300u32),
            rate_limit_window_ms: env_or("STRATA_RATE_LIMIT_WINDOW_MS", 60_000u64),
            sql_max_rows: env_or("STRATA_SQL_MAX_ROWS", 1_000u32),
            sql_statement_timeout_ms: env_or("STRATA_SQL_STATEMENT_TIMEOUT_MS", 30_000u64),
            public_storage_url: std::env::var("STRATA_PUBLIC_STORAGE_URL").ok(),
        };

        let cfg = Self {
            database,
            object_store,
            master_key_secret: required("STRATA_MASTER_KEY")?,
            scheduler,
            presigned_url_expiry: Duration::from_secs(env_or(
                "STRATA_PRESIGNED_URL_EXPIRY_SECONDS",
                3_600u64,
            )),
            max_upload_size_bytes: env_or("STRATA_MAX_UPLOAD_SIZE_BYTES", 100 * 1024 * 1024i64),
            settings,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        if self.database.host.trim().is_empty() {
            return Err(Error::BadRequest("database.host is empty".to_string()));
        }
        if self.database.pool_max == 0 {
            return Err(Error::BadRequest(
                "database.pool_max must be > 0".to_string(),
            ));
        }
        if self.object_store.endpoint.trim().is_empty() {
            return Err(Error::BadRequest("object_store.endpoint is empty".to_string()));
        }
        if self.scheduler.poll_interval.is_zero() {
            return Err(Error::BadRequest(
                "scheduler.poll_interval must be > 0".to_string(),
            ));
        }
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(Error::BadRequest(
                "scheduler.max_concurrent_jobs must be > 0".to_string(),
            ));
        }
        if self.max_upload_size_bytes <= 0 {
            return Err(Error::BadRequest(
                "max_upload_size_bytes must be > 0".to_string(),
            ));
        }
        crate::crypto::derive_master_key(&self.master_key_secret)?;
        Ok(())
    }
}

/// Settings mutable at runtime via the admin settings endpoints. Readers
/// take a whole-struct snapshot; writers swap the whole struct.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    pub sql_max_rows: u32,
    pub sql_statement_timeout_ms: u64,
    pub public_storage_url: Option<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            rate_limit_max: 300,
            rate_limit_window_ms: 60_000,
            sql_max_rows: 1_000,
            sql_statement_timeout_ms: 30_000,
            public_storage_url: None,
        }
    }
}

/// Shared handle to the runtime settings snapshot.
#[derive(Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<RuntimeSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> RuntimeSettings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    pub fn replace(&self, settings: RuntimeSettings) {
        *self.inner.write().expect("settings lock poisoned") = settings;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_snapshot_is_atomic() {
        let handle = SettingsHandle::default();
        let before = handle.snapshot();
        assert_eq!(before.sql_max_rows, 1_000);

        let mut next = before.clone();
        next.sql_max_rows = 500;
        next.public_storage_url = Some("https://cdn.example.com".to_string());
        handle.replace(next);

        let after = handle.snapshot();
        assert_eq!(after.sql_max_rows, 500);
        assert_eq!(
            after.public_storage_url.as_deref(),
            Some("https://cdn.example.com")
        );
    }

    #[test]
    fn database_url_includes_all_parts() {
        let cfg = DatabaseConfig {
            host: "db.internal".to_string(),
            port: 5433,
            database: "strata".to_string(),
            user: "platform".to_string(),
            password: "pw".to_string(),
            pool_max: 10,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        };
        assert_eq!(cfg.url(), "postgres://platform:pw@db.internal:5433/strata");
        assert_eq!(
            cfg.url_for("proj_abc"),
            "postgres://platform:pw@db.internal:5433/proj_abc"
        );
    }
}

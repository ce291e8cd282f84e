//! Strata core: the request-execution plane of a self-hosted multi-tenant
//! data platform. Provisions isolated tenant databases and object
//! namespaces, routes queries at two privilege tiers, compiles a safe
//! CRUD grammar, executes gated admin SQL, brokers object storage, and
//! runs backups and scheduled jobs.

pub mod backup;
pub mod config;
pub mod crud;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod models;
pub mod objects;
pub mod scheduler;
pub mod sqlexec;
pub mod store;
pub mod tenant;

pub use config::{PlatformConfig, RuntimeSettings, SettingsHandle};
pub use crypto::{CryptoService, EncryptedPayload};
pub use error::{Error, Result};
pub use models::{
    ApiKey, ApiKeyType, AuditEntry, Backup, BackupFormat, BackupStatus, BackupType, CronJob,
    CronJobRun, CronJobType, DbPrincipal, FileMetadata, InviteKey, ListQuery, LogicalBucket,
    Project, ProjectContext, ProjectCredential, ProjectId, RunStatus, SessionRecord, UserId,
    UserRecord, UserRole,
};
pub use store::{MemoryPlatformDb, PlatformDb, PostgresPlatformDb};

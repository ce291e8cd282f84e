//! API-key service: issue, validate, rotate, and revoke project keys.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{constant_time_compare, generate_api_key, sha256_hex};
use crate::models::{ApiKey, ApiKeyType, ProjectContext, ProjectId};
use crate::store::PlatformDb;
use crate::{Error, Result};

/// A freshly issued key: the stored row plus the plaintext, which is
/// returned exactly once.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub key: ApiKey,
    pub plaintext: String,
}

#[derive(Clone)]
pub struct ApiKeyService {
    store: Arc<dyn PlatformDb>,
}

impl ApiKeyService {
    pub fn new(store: Arc<dyn PlatformDb>) -> Self {
        Self { store }
    }

    /// Build (but do not persist) a new key row with its plaintext.
    pub fn mint(
        project_id: ProjectId,
        key_type: ApiKeyType,
        expires_at: Option<DateTime<Utc>>,
    ) -> IssuedKey {
        let plaintext = generate_api_key(key_type);
        let key = ApiKey {
            id: Uuid::new_v4(),
            project_id,
            key_type,
            hash: sha256_hex(plaintext.as_bytes()),
            prefix: plaintext.chars().take(8).collect(),
            created_at: Utc::now(),
            expires_at,
            revoked_at: None,
        };
        IssuedKey { key, plaintext }
    }

    /// Mint and persist a new key for a project.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn issue(
        &self,
        project_id: ProjectId,
        key_type: ApiKeyType,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedKey> {
        let issued = Self::mint(project_id, key_type, expires_at);
        self.store.insert_api_key(&issued.key).await?;
        Ok(issued)
    }

    /// Resolve a plaintext key to its project context.
    ///
    /// The hash is computed once, then compared against every active key
    /// under constant-time comparison. The linear scan is deliberate: it
    /// keeps the comparison side-channel-safe where an index lookup would
    /// leak on match position.
    #[tracing::instrument(level = "debug", skip(self, plaintext))]
    pub async fn validate(&self, plaintext: &str) -> Result<Option<ProjectContext>> {
        let candidate = sha256_hex(plaintext.trim().as_bytes());
        let now = Utc::now();
        let keys = self.store.list_active_api_keys(now).await?;
        let mut found: Option<ProjectContext> = None;
        for key in &keys {
            if constant_time_compare(&candidate, &key.hash) && found.is_none() {
                found = Some(ProjectContext {
                    project_id: key.project_id,
                    key_id: key.id,
                    key_type: key.key_type,
                });
            }
        }
        Ok(found)
    }

    /// Revoke all active keys of `key_type` and issue a replacement, in one
    /// store transaction.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn rotate(&self, project_id: ProjectId, key_type: ApiKeyType) -> Result<IssuedKey> {
        let issued = Self::mint(project_id, key_type, None);
        self.store
            .rotate_api_keys(project_id, key_type, &issued.key, Utc::now())
            .await?;
        Ok(issued)
    }

    /// Revoke a single key. Errors with `NotFound` if the key does not
    /// exist or is already inactive.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn revoke(&self, key_id: Uuid) -> Result<()> {
        if self.store.revoke_api_key(key_id, Utc::now()).await? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("active api key {key_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPlatformDb;

    fn service() -> (ApiKeyService, Arc<MemoryPlatformDb>) {
        let store = Arc::new(MemoryPlatformDb::new());
        (ApiKeyService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn issue_then_validate() {
        let (svc, _) = service();
        let project = ProjectId::new();
        let issued = svc.issue(project, ApiKeyType::Secret, None).await.unwrap();
        assert!(issued.plaintext.starts_with("sk_"));
        assert_eq!(issued.key.prefix.len(), 8);

        let ctx = svc.validate(&issued.plaintext).await.unwrap().unwrap();
        assert_eq!(ctx.project_id, project);
        assert_eq!(ctx.key_type, ApiKeyType::Secret);
        assert_eq!(ctx.key_id, issued.key.id);
    }

    #[tokio::test]
    async fn unknown_key_does_not_validate() {
        let (svc, _) = service();
        let project = ProjectId::new();
        svc.issue(project, ApiKeyType::Publishable, None)
            .await
            .unwrap();
        assert!(svc.validate("pk_not_a_real_key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_key_does_not_validate() {
        let (svc, _) = service();
        let project = ProjectId::new();
        let issued = svc
            .issue(
                project,
                ApiKeyType::Secret,
                Some(Utc::now() - chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        assert!(svc.validate(&issued.plaintext).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotate_revokes_previous_key_of_same_type() {
        let (svc, store) = service();
        let project = ProjectId::new();
        let old = svc.issue(project, ApiKeyType::Secret, None).await.unwrap();
        let other_tier = svc
            .issue(project, ApiKeyType::Publishable, None)
            .await
            .unwrap();

        let rotated = svc.rotate(project, ApiKeyType::Secret).await.unwrap();

        assert!(svc.validate(&old.plaintext).await.unwrap().is_none());
        let stored = store.get_api_key(old.key.id).await.unwrap().unwrap();
        assert!(stored.revoked_at.is_some());

        let ctx = svc.validate(&rotated.plaintext).await.unwrap().unwrap();
        assert_eq!(ctx.project_id, project);
        assert_eq!(ctx.key_type, ApiKeyType::Secret);

        // The other tier is untouched.
        assert!(svc.validate(&other_tier.plaintext).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoke_twice_errors() {
        let (svc, _) = service();
        let project = ProjectId::new();
        let issued = svc.issue(project, ApiKeyType::Secret, None).await.unwrap();
        svc.revoke(issued.key.id).await.unwrap();
        assert!(matches!(
            svc.revoke(issued.key.id).await,
            Err(Error::NotFound(_))
        ));
    }
}

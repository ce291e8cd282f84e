//! Object storage: the S3-compatible backend trait and the broker that
//! maps project identity onto physical buckets and logical prefixes.

pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{FileMetadata, ProjectId};
use crate::store::PlatformDb;
use crate::{Error, Result};

pub use s3::S3ObjectStore;

/// Fixed bucket holding platform and project backups.
pub const BACKUP_BUCKET: &str = "strata-backups";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
}

/// S3-compatible storage operations against physical buckets.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_bucket(&self, bucket: &str) -> Result<()>;
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;
    async fn put(&self, bucket: &str, key: &str, data: Bytes, content_type: &str) -> Result<()>;
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>>;
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;
    /// Up to `limit` objects under `prefix`, paginating internally.
    async fn list(&self, bucket: &str, prefix: &str, limit: usize) -> Result<Vec<ObjectInfo>>;
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        expires: Duration,
    ) -> Result<String>;
    async fn presign_get(&self, bucket: &str, key: &str, expires: Duration) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct UploadGrant {
    pub object_key: String,
    pub url: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DownloadGrant {
    pub url: String,
    pub expires_in: u64,
}

/// Broker between project identity and the object store.
///
/// Each project owns one physical bucket (`proj-<id>`); logical buckets
/// are key prefixes inside it and must pre-exist in the metadata store.
pub struct StorageBroker {
    store: Arc<dyn PlatformDb>,
    objects: Arc<dyn ObjectStore>,
    presign_expiry: Duration,
    max_upload_size_bytes: i64,
}

impl StorageBroker {
    pub fn new(
        store: Arc<dyn PlatformDb>,
        objects: Arc<dyn ObjectStore>,
        presign_expiry: Duration,
        max_upload_size_bytes: i64,
    ) -> Self {
        Self {
            store,
            objects,
            presign_expiry,
            max_upload_size_bytes,
        }
    }

    pub fn physical_bucket(project_id: ProjectId) -> String {
        format!("proj-{project_id}")
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    /// Issue a presigned PUT for `(logical, path)` and record best-effort
    /// file metadata. The object store remains the ground truth.
    pub async fn presign_upload(
        &self,
        project_id: ProjectId,
        logical: &str,
        path: &str,
        content_type: &str,
        max_size: Option<i64>,
    ) -> Result<UploadGrant> {
        self.ensure_logical_bucket(project_id, logical).await?;
        validate_object_path(path)?;
        let max_size = max_size.unwrap_or(0);
        if max_size > self.max_upload_size_bytes {
            return Err(Error::BadRequest(format!(
                "maxSize exceeds the {} byte upload cap",
                self.max_upload_size_bytes
            )));
        }

        let object_key = format!("{logical}/{path}");
        let url = self
            .objects
            .presign_put(
                &Self::physical_bucket(project_id),
                &object_key,
                content_type,
                self.presign_expiry,
            )
            .await?;

        let meta = FileMetadata {
            id: Uuid::new_v4(),
            project_id,
            logical_bucket: logical.to_string(),
            object_key: object_key.clone(),
            content_type: content_type.to_string(),
            size_bytes: max_size.max(0),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.upsert_file_metadata(&meta).await {
            tracing::warn!(project_id = %project_id, object_key = %object_key, error = %e,
                "file metadata upsert failed");
        }

        Ok(UploadGrant {
            object_key,
            url,
            expires_in: self.presign_expiry.as_secs(),
        })
    }

    /// Time-limited download URL. No listing happens here.
    pub async fn presign_download(
        &self,
        project_id: ProjectId,
        logical: &str,
        object_key: &str,
    ) -> Result<DownloadGrant> {
        self.ensure_logical_bucket(project_id, logical).await?;
        let key = self.qualified_key(logical, object_key)?;
        let url = self
            .objects
            .presign_get(&Self::physical_bucket(project_id), &key, self.presign_expiry)
            .await?;
        Ok(DownloadGrant {
            url,
            expires_in: self.presign_expiry.as_secs(),
        })
    }

    /// List objects in a logical bucket. Callers must hold secret-tier
    /// authorization; the HTTP layer enforces that.
    pub async fn list(
        &self,
        project_id: ProjectId,
        logical: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ObjectInfo>> {
        self.ensure_logical_bucket(project_id, logical).await?;
        let limit = limit.clamp(1, 1000);
        let mut full_prefix = format!("{logical}/");
        if let Some(p) = prefix {
            validate_object_path(p)?;
            full_prefix.push_str(p);
        }
        self.objects
            .list(&Self::physical_bucket(project_id), &full_prefix, limit)
            .await
    }

    /// Remove an object and its metadata row.
    pub async fn delete(
        &self,
        project_id: ProjectId,
        logical: &str,
        object_key: &str,
    ) -> Result<()> {
        self.ensure_logical_bucket(project_id, logical).await?;
        let key = self.qualified_key(logical, object_key)?;
        self.objects
            .delete(&Self::physical_bucket(project_id), &key)
            .await?;
        self.store.delete_file_metadata(project_id, &key).await?;
        Ok(())
    }

    pub async fn create_project_namespace(&self, project_id: ProjectId) -> Result<()> {
        self.objects
            .create_bucket(&Self::physical_bucket(project_id))
            .await
    }

    /// Drain and delete a project's physical bucket.
    pub async fn destroy_project_namespace(&self, project_id: ProjectId) -> Result<()> {
        let bucket = Self::physical_bucket(project_id);
        loop {
            let batch = self.objects.list(&bucket, "", 1000).await?;
            if batch.is_empty() {
                break;
            }
            for obj in batch {
                self.objects.delete(&bucket, &obj.key).await?;
            }
        }
        self.objects.delete_bucket(&bucket).await
    }

    async fn ensure_logical_bucket(&self, project_id: ProjectId, logical: &str) -> Result<()> {
        if self.store.get_bucket(project_id, logical).await?.is_none() {
            return Err(Error::NotFound(format!("bucket '{logical}'")));
        }
        Ok(())
    }

    /// Accept object keys both with and without the logical prefix.
    fn qualified_key(&self, logical: &str, object_key: &str) -> Result<String> {
        let bare = object_key
            .strip_prefix(&format!("{logical}/"))
            .unwrap_or(object_key);
        validate_object_path(bare)?;
        Ok(format!("{logical}/{bare}"))
    }
}

/// Object paths are restricted to a conservative character class.
pub fn validate_object_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::BadRequest("object path is empty".to_string()));
    }
    if path.len() > 1024 {
        return Err(Error::BadRequest("object path is too long".to_string()));
    }
    if path.starts_with('/') {
        return Err(Error::BadRequest(
            "object path must not start with '/'".to_string(),
        ));
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(Error::BadRequest(
            "object path must not contain empty, '.' or '..' segments".to_string(),
        ));
    }
    let ok = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ' '));
    if !ok {
        return Err(Error::BadRequest(
            "object path contains forbidden characters".to_string(),
        ));
    }
    Ok(())
}

/// No-op object store for tests that need an `ObjectStore` but never
/// touch it.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct NullObjectStore;

    #[async_trait]
    impl ObjectStore for NullObjectStore {
        async fn create_bucket(&self, _bucket: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_bucket(&self, _bucket: &str) -> Result<()> {
            Ok(())
        }
        async fn put(&self, _b: &str, _k: &str, _d: Bytes, _c: &str) -> Result<()> {
            Ok(())
        }
        async fn get(&self, _b: &str, _k: &str) -> Result<Option<Bytes>> {
            Ok(None)
        }
        async fn delete(&self, _b: &str, _k: &str) -> Result<()> {
            Ok(())
        }
        async fn list(&self, _b: &str, _p: &str, _l: usize) -> Result<Vec<ObjectInfo>> {
            Ok(Vec::new())
        }
        async fn presign_put(
            &self,
            _b: &str,
            _k: &str,
            _c: &str,
            _e: Duration,
        ) -> Result<String> {
            Ok("http://presigned.put".to_string())
        }
        async fn presign_get(&self, _b: &str, _k: &str, _e: Duration) -> Result<String> {
            Ok("http://presigned.get".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_bucket_name() {
        let id = ProjectId::new();
        assert_eq!(
            StorageBroker::physical_bucket(id),
            format!("proj-{}", id.0)
        );
    }

    #[test]
    fn object_path_validation() {
        assert!(validate_object_path("avatars/me.png").is_ok());
        assert!(validate_object_path("a-b_c.d/e f").is_ok());
        assert!(validate_object_path("").is_err());
        assert!(validate_object_path("/abs").is_err());
        assert!(validate_object_path("a//b").is_err());
        assert!(validate_object_path("a/../b").is_err());
        assert!(validate_object_path("a/./b").is_err());
        assert!(validate_object_path("tab\tchar").is_err());
        assert!(validate_object_path(&"x".repeat(1025)).is_err());
    }
}

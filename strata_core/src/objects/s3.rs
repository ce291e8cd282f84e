use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use std::time::Duration;

use crate::config::ObjectStoreConfig;
use crate::objects::{ObjectInfo, ObjectStore};
use crate::{Error, Result};

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn new(cfg: &ObjectStoreConfig) -> Result<Self> {
        let creds = Credentials::new(
            cfg.access_key.clone(),
            cfg.secret_key.clone(),
            None,
            None,
            "strata_static",
        );

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .credentials_provider(creds)
            .endpoint_url(cfg.endpoint_url())
            .load()
            .await;

        let s3_cfg = aws_sdk_s3::config::Builder::from(&shared)
            // MinIO and friends do not support virtual-hosted buckets.
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_cfg),
        })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn is_not_found(message: &str) -> bool {
    message.contains("NoSuchKey") || message.contains("NotFound") || message.contains("NoSuchBucket")
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                let msg = e.to_string();
                // Re-provisioning the same project is idempotent.
                if msg.contains("BucketAlreadyOwnedByYou") || msg.contains("BucketAlreadyExists") {
                    return Ok(());
                }
                Err(Error::object_store("create_bucket", e))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.delete_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                if is_not_found(&e.to_string()) {
                    return Ok(());
                }
                Err(Error::object_store("delete_bucket", e))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, data))]
    async fn put(&self, bucket: &str, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Error::object_store("put_object", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        let resp = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(r) => r,
            Err(e) => {
                if is_not_found(&e.to_string()) {
                    return Ok(None);
                }
                return Err(Error::object_store("get_object", e));
            }
        };
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::object_store("collect object body", e))?
            .into_bytes();
        Ok(Some(data))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::object_store("delete_object", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list(&self, bucket: &str, prefix: &str, limit: usize) -> Result<Vec<ObjectInfo>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .max_keys((limit - out.len()).min(1000) as i32);
            if let Some(t) = token.take() {
                req = req.continuation_token(t);
            }
            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    if is_not_found(&e.to_string()) {
                        return Ok(out);
                    }
                    return Err(Error::object_store("list_objects_v2", e));
                }
            };

            if let Some(contents) = resp.contents {
                for obj in contents {
                    if let Some(key) = obj.key {
                        out.push(ObjectInfo {
                            key,
                            size: obj.size.unwrap_or(0),
                        });
                        if out.len() >= limit {
                            return Ok(out);
                        }
                    }
                }
            }

            if resp.is_truncated.unwrap_or(false) {
                token = resp.next_continuation_token;
                if token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(out)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        expires: Duration,
    ) -> Result<String> {
        let cfg = PresigningConfig::expires_in(expires)
            .map_err(|e| Error::object_store("presigning config", e))?;
        let presigned = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .presigned(cfg)
            .await
            .map_err(|e| Error::object_store("presign put_object", e))?;
        Ok(presigned.uri().to_string())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn presign_get(&self, bucket: &str, key: &str, expires: Duration) -> Result<String> {
        let cfg = PresigningConfig::expires_in(expires)
            .map_err(|e| Error::object_store("presigning config", e))?;
        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(cfg)
            .await
            .map_err(|e| Error::object_store("presign get_object", e))?;
        Ok(presigned.uri().to_string())
    }
}

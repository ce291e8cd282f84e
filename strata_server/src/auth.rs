//! Session authentication contract for the admin plane.
//!
//! Session issuance (login, logout, password handling) belongs to the
//! external authentication service; this side only resolves a request to
//! a platform user. The store-backed provider looks the presented token
//! up in the sessions table.

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use chrono::Utc;
use std::sync::Arc;
use strata_core::crypto::sha256_hex;
use strata_core::models::UserRecord;
use strata_core::store::PlatformDb;

use crate::error::ApiError;

#[async_trait]
pub trait SessionAuth: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserRecord>, ApiError>;
}

/// Extension wrapper so the provider travels through the router layers.
#[derive(Clone)]
pub struct SessionAuthExt(pub Arc<dyn SessionAuth>);

pub struct StoreSessionAuth {
    store: Arc<dyn PlatformDb>,
}

impl StoreSessionAuth {
    pub fn new(store: Arc<dyn PlatformDb>) -> Self {
        Self { store }
    }

    /// Token from `Authorization: Bearer ...` or the `sid` cookie.
    fn token(headers: &HeaderMap) -> Option<String> {
        if let Some(authz) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            if let Some(token) = authz
                .strip_prefix("Bearer ")
                .or_else(|| authz.strip_prefix("bearer "))
            {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
        let cookies = headers.get(COOKIE).and_then(|v| v.to_str().ok())?;
        for pair in cookies.split(';') {
            let (name, value) = pair.trim().split_once('=')?;
            if name == "sid" && !value.is_empty() {
                return Some(value.to_string());
            }
        }
        None
    }
}

#[async_trait]
impl SessionAuth for StoreSessionAuth {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserRecord>, ApiError> {
        let Some(token) = Self::token(headers) else {
            return Ok(None);
        };
        let hash = sha256_hex(token.as_bytes());
        let Some(session) = self.store.get_session(&hash).await? else {
            return Ok(None);
        };
        if session.expires_at < Utc::now() {
            return Ok(None);
        }
        let user = self.store.get_user(session.user_id).await?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use strata_core::models::{SessionRecord, UserId, UserRole};
    use strata_core::store::MemoryPlatformDb;
    use uuid::Uuid;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn token_from_bearer_or_cookie() {
        let h = headers_with("authorization", "Bearer tok123");
        assert_eq!(StoreSessionAuth::token(&h).as_deref(), Some("tok123"));

        let h = headers_with("cookie", "theme=dark; sid=abc; lang=en");
        assert_eq!(StoreSessionAuth::token(&h).as_deref(), Some("abc"));

        let h = headers_with("cookie", "theme=dark");
        assert!(StoreSessionAuth::token(&h).is_none());
    }

    #[tokio::test]
    async fn expired_sessions_do_not_authenticate() {
        let store = std::sync::Arc::new(MemoryPlatformDb::new());
        let user_id = UserId(Uuid::new_v4());
        store
            .upsert_user(&UserRecord {
                user_id,
                email: "ops@example.com".to_string(),
                display_name: None,
                role: UserRole::Admin,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .insert_session(&SessionRecord {
                token_hash: sha256_hex(b"stale"),
                user_id,
                expires_at: Utc::now() - chrono::Duration::minutes(1),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .insert_session(&SessionRecord {
                token_hash: sha256_hex(b"fresh"),
                user_id,
                expires_at: Utc::now() + chrono::Duration::hours(1),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let auth = StoreSessionAuth::new(store);
        let stale = headers_with("authorization", "Bearer stale");
        assert!(auth.authenticate(&stale).await.unwrap().is_none());
        let fresh = headers_with("authorization", "Bearer fresh");
        let user = auth.authenticate(&fresh).await.unwrap().unwrap();
        assert_eq!(user.user_id, user_id);
    }
}

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::sync::Arc;
use strata_core::models::{ApiKeyType, ProjectContext, UserRecord};

use crate::auth::SessionAuthExt;
use crate::error::ApiError;
use crate::server::AppState;

/// Project context resolved from the `x-api-key` header.
#[derive(Debug, Clone)]
pub struct ApiKeyContext(pub ProjectContext);

impl ApiKeyContext {
    /// Mutating CRUD and storage listing require the secret tier.
    pub fn require_secret(&self) -> Result<(), ApiError> {
        if self.0.key_type == ApiKeyType::Secret {
            Ok(())
        } else {
            Err(ApiError::SecretKeyRequired)
        }
    }
}

impl<S> FromRequestParts<S> for ApiKeyContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    #[tracing::instrument(level = "debug", name = "extract.api_key", skip_all)]
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let state = parts
            .extensions
            .get::<Arc<AppState>>()
            .cloned()
            .ok_or_else(|| {
                ApiError::Core(strata_core::Error::Internal(
                    "app state missing from request".to_string(),
                ))
            })?;
        let key = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ApiError::MissingApiKey)?;
        let context = state
            .keys
            .validate(key)
            .await?
            .ok_or(ApiError::InvalidApiKey)?;
        Ok(Self(context))
    }
}

/// Admin-plane user resolved through the session provider.
#[derive(Debug, Clone)]
pub struct AdminUser(pub UserRecord);

impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    #[tracing::instrument(level = "debug", name = "extract.admin_user", skip_all)]
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let provider = parts
            .extensions
            .get::<SessionAuthExt>()
            .cloned()
            .ok_or(ApiError::SessionRequired)?;
        let user = provider
            .0
            .authenticate(&parts.headers)
            .await?
            .ok_or(ApiError::SessionRequired)?;
        Ok(Self(user))
    }
}

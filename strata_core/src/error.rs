use std::error::Error as StdError;

/// Common error type for `strata_core`.
///
/// Variants are stable, transport-agnostic kinds; the HTTP layer maps them
/// 1:1 onto status codes and machine-readable envelope codes. Backend
/// implementations should preserve the underlying error chain via
/// `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("too many requests: {0}")]
    TooManyRequests(String),

    /// Envelope encryption or decryption failure. Callers must not fall
    /// back to treating ciphertext as plaintext.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Unknown table or column against the cached tenant schema.
    #[error("schema error: {0}")]
    Schema(String),

    /// Admin SQL matched the privileged-operation denylist.
    #[error("statement denied: {0}")]
    Denied(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("object store error: {context}")]
    ObjectStore {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("database error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("database error: {0}")]
    BackendMessage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn object_store(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::ObjectStore {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Stable machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BadRequest(_) | Error::Schema(_) | Error::Denied(_) => "BAD_REQUEST",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::TooManyRequests(_) => "TOO_MANY_REQUESTS",
            Error::Timeout(_) => "INTERNAL_ERROR",
            Error::Crypto(_)
            | Error::ObjectStore { .. }
            | Error::Backend { .. }
            | Error::BackendMessage(_)
            | Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Service error types.
//!
//! [`ApiError`] is what request handlers return. It carries its HTTP status
//! as data and renders a client-facing body; internal details are only
//! included outside production.

use std::time::Duration;

use authgate_authn::{AuthFailure, KeyFetchError, SessionLookupError};
use authgate_storage::{ConnectError, CredentialFetchError, PoolError, StoreError};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::settings::Environment;

/// One invalid configuration variable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{variable}: {reason}")]
pub struct FieldError {
    /// Environment variable name.
    pub variable: &'static str,
    /// What is wrong with it.
    pub reason: String,
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The environment could not be read.
    #[error("Failed to read configuration: {0}")]
    Source(#[from] ::config::ConfigError),

    /// One or more variables are missing or invalid.
    #[error("Invalid configuration: {}", join(.0))]
    Invalid(Vec<FieldError>),
}

fn join(problems: &[FieldError]) -> String {
    problems.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// The service could not be assembled from its configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InitError {
    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The key-set client could not be built.
    #[error("Key-set client: {0}")]
    KeySet(#[from] KeyFetchError),

    /// The session client could not be built.
    #[error("Session client: {0}")]
    Session(#[from] SessionLookupError),

    /// The credential source could not be built.
    #[error("Credential source: {0}")]
    Credential(#[from] CredentialFetchError),

    /// The database connector could not be built.
    #[error("Database connector: {0}")]
    Connector(#[from] ConnectError),

    /// Logging could not be installed.
    #[error("Telemetry: {0}")]
    Telemetry(String),
}

/// Errors returned to API clients.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; new variants may be added in
/// future minor releases without a semver-breaking change.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    /// No valid session or bearer token.
    #[error("Unauthenticated")]
    Unauthenticated,

    /// The caller is authenticated but has no user record.
    #[error("User not found")]
    UserNotFound,

    /// Database credentials could not be obtained.
    #[error("Database credentials unavailable")]
    CredentialFetch(#[source] CredentialFetchError),

    /// No database connection became available in time.
    #[error("Database busy")]
    PoolTimeout {
        /// How long the request waited.
        waited: Duration,
    },

    /// Anything else.
    #[error("Internal server error")]
    Internal(String),
}

/// Serialized error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// Client-facing message.
    pub message: String,
    /// HTTP status code.
    pub status: u16,
    /// Internal detail; omitted in production.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::UserNotFound => StatusCode::NOT_FOUND,
            Self::CredentialFetch(_) | Self::PoolTimeout { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }

    /// Whether this is a server-side failure.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }

    fn detail(&self) -> Option<String> {
        match self {
            Self::Unauthenticated | Self::UserNotFound => None,
            Self::CredentialFetch(e) => Some(e.to_string()),
            Self::PoolTimeout { waited } => Some(format!("no connection within {waited:?}")),
            Self::Internal(detail) => Some(detail.clone()),
        }
    }

    /// Response body for `environment`.
    #[must_use]
    pub fn body(&self, environment: Environment) -> ErrorBody {
        ErrorBody {
            message: self.to_string(),
            status: self.status().as_u16(),
            detail: if environment.is_production() { None } else { self.detail() },
        }
    }
}

impl From<AuthFailure> for ApiError {
    fn from(_: AuthFailure) -> Self {
        Self::Unauthenticated
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Timeout { waited } => Self::PoolTimeout { waited },
            PoolError::Credential(e) | PoolError::Connect(ConnectError::Credential(e)) => {
                Self::CredentialFetch(e)
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Pool(e) => e.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

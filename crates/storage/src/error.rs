//! Storage error types.
//!
//! - [`CredentialFetchError`]: a credential could not be produced
//! - [`ConnectError`]: a physical connection could not be opened
//! - [`PoolError`]: a pooled connection could not be handed out
//! - [`StoreError`]: a data operation failed
//!
//! Errors that feed retry decisions expose [`is_transient`](ConnectError::is_transient).

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Failure to obtain database credentials.
///
/// Cloneable so that every caller waiting on one refresh receives the same
/// outcome.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; new variants may be added in
/// future minor releases without a semver-breaking change.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CredentialFetchError {
    /// The token endpoint could not be reached.
    #[error("Token request failed: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
        /// Underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The token endpoint answered with a non-success status.
    #[error("Token endpoint returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The token response could not be understood.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// A static connection string is unusable.
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),
}

impl CredentialFetchError {
    /// Creates a `Transport` error with a source.
    #[must_use]
    pub fn transport(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates an `InvalidResponse` error.
    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures, throttling and server errors are transient;
    /// malformed responses and bad configuration are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status } => *status == 429 || *status >= 500,
            Self::InvalidResponse(_) | Self::InvalidConnectionString(_) => false,
        }
    }
}

/// Failure to open a physical database connection.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// No credential was available for the attempt.
    #[error("Credential unavailable: {0}")]
    Credential(#[from] CredentialFetchError),

    /// The server could not be reached or dropped the connection.
    #[error("Connection failed: {message}")]
    Unreachable {
        /// Description of the failure.
        message: String,
        /// Underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The server refused the credential or the database.
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// TLS could not be set up.
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl ConnectError {
    /// Creates an `Unreachable` error with a source.
    #[must_use]
    pub fn unreachable(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unreachable { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Credential(e) => e.is_transient(),
            Self::Unreachable { .. } => true,
            Self::Rejected(_) | Self::Tls(_) => false,
        }
    }
}

/// Failure to hand out a pooled connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No connection became available within the acquire timeout.
    #[error("Timed out after {waited:?} waiting for a database connection")]
    Timeout {
        /// How long the caller waited.
        waited: std::time::Duration,
    },

    /// The pool has been shut down.
    #[error("Connection pool is closed")]
    Closed,

    /// Credentials for building the pool could not be obtained.
    #[error("Credential unavailable: {0}")]
    Credential(#[from] CredentialFetchError),

    /// A new connection could not be opened after all retries.
    #[error("Connection failed: {0}")]
    Connect(#[source] ConnectError),

    /// The pool itself is misconfigured.
    #[error("Pool error: {0}")]
    Internal(String),
}

impl PoolError {
    /// Creates an `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Failure of a data operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No connection could be obtained.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The query itself failed.
    #[error("Query failed: {message}")]
    Query {
        /// Description of the failure.
        message: String,
        /// Underlying error.
        #[source]
        source: Option<BoxError>,
    },
}

impl StoreError {
    /// Creates a `Query` error with a source.
    #[must_use]
    pub fn query(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Query { message: message.into(), source: Some(Arc::new(source)) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(CredentialFetchError::Status { status: 503 }, true)]
    #[case(CredentialFetchError::Status { status: 429 }, true)]
    #[case(CredentialFetchError::Status { status: 400 }, false)]
    #[case(CredentialFetchError::invalid_response("no access_token"), false)]
    #[case(CredentialFetchError::InvalidConnectionString("no user".into()), false)]
    fn test_credential_error_transience(
        #[case] err: CredentialFetchError,
        #[case] transient: bool,
    ) {
        assert_eq!(err.is_transient(), transient);
        assert_eq!(ConnectError::from(err).is_transient(), transient);
    }

    #[test]
    fn test_connect_error_transience() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(ConnectError::unreachable("connect", io).is_transient());
        assert!(!ConnectError::Rejected("password authentication failed".into()).is_transient());
    }

    #[test]
    fn test_source_chain_preserved() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = StoreError::query("select user", io);
        assert_eq!(err.source().expect("source").to_string(), "timed out");
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::Timeout { waited: std::time::Duration::from_millis(50) };
        assert_eq!(err.to_string(), "Timed out after 50ms waiting for a database connection");
        assert_eq!(PoolError::Closed.to_string(), "Connection pool is closed");
    }
}

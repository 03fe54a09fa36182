//! Database credentials and connection pooling for authgate.
//!
//! This crate owns everything between the service and the database: where
//! the login credential comes from, how it is kept fresh, and how
//! connections are pooled on top of it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      UserStore                              │
//! │                 (PgUserStore, queries)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 ConnectionPoolManager                       │
//! │     (lazy singleton pool, acquire timeout, retry)           │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │   CredentialProvider         │        Connector             │
//! │ Static │ Managed (TokenIssuer)│   PgConnector (TLS)         │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Credentials
//!
//! | Provider | Source | Refresh |
//! |----------|--------|---------|
//! | [`StaticCredentialProvider`] | Connection string | Never |
//! | [`ManagedCredentialProvider`] | [`TokenIssuer`] (instance metadata) | Inside the refresh margin |
//!
//! A managed credential is re-issued by exactly one caller at a time; every
//! other caller waiting on the refresh receives the same outcome.
//!
//! # Pool
//!
//! The pool is built on first use and at most once, no matter how many
//! callers race for it. With a managed provider, each new connection asks
//! the provider for the current credential, so connections opened after a
//! refresh authenticate with the new token.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with in-memory doubles for the token issuer,
//!   connector and user store. Enable this in `[dev-dependencies]` for integration tests.
//! - **`failpoints`**: Compiles the `fail` crate's injection points into the retry loop and the
//!   connect path.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod credential;
pub mod error;
pub mod issuer;
pub mod pool;
pub mod postgres;
pub mod retry;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod users;

// Re-export primary types at crate root for convenience
pub use credential::{
    Credential, CredentialKind, CredentialProvider, DEFAULT_DATABASE_SCOPE, DEFAULT_REFRESH_MARGIN,
    ManagedCredentialConfig, ManagedCredentialProvider, StaticCredentialProvider,
};
pub use error::{BoxError, ConnectError, CredentialFetchError, PoolError, StoreError};
pub use issuer::{IMDS_TOKEN_ENDPOINT, ImdsTokenIssuer, IssuedToken, TokenIssuer};
pub use pool::{
    ConnectionPoolManager, Connector, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_MAX_SIZE, PoolConfig,
    PoolState, PoolStatus, PooledConnection,
};
pub use postgres::PgConnector;
pub use retry::{RetryConfig, Transient, with_retry};
pub use users::{PgUserStore, UserRecord, UserStore};
pub use zeroize::Zeroizing;

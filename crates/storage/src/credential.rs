//! Database credentials.
//!
//! A [`CredentialProvider`] hands out the credential for the next physical
//! connection. Two variants exist, selected at startup:
//!
//! - [`StaticCredentialProvider`]: a user and password parsed once from a
//!   connection string
//! - [`ManagedCredentialProvider`]: a short-lived token from a
//!   [`TokenIssuer`], refreshed once it comes within a safety margin of
//!   expiry
//!
//! # Refresh
//!
//! The managed provider reads its cached credential under a read lock. When
//! that credential is missing or due for refresh, callers queue on a
//! provider-scoped async mutex; the first one in issues a token and the rest
//! find the fresh credential on re-check. M callers racing past expiry cost
//! one issuance, and all M receive its result, success or failure.

use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    error::CredentialFetchError,
    issuer::TokenIssuer,
    retry::{RetryConfig, with_retry},
};

/// Resource scope of the managed PostgreSQL service.
pub const DEFAULT_DATABASE_SCOPE: &str = "https://ossrdbms-aad.database.windows.net/.default";

/// Default safety margin before expiry at which a token is refreshed.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// A database login.
#[derive(Clone)]
pub struct Credential {
    principal: String,
    secret: Zeroizing<String>,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("secret", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    /// A credential that never expires.
    #[must_use]
    pub fn non_expiring(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: Zeroizing::new(secret.into()),
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    /// A credential valid until `expires_at`.
    #[must_use]
    pub fn expiring(
        principal: impl Into<String>,
        secret: Zeroizing<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self { principal: principal.into(), secret, issued_at: Utc::now(), expires_at: Some(expires_at) }
    }

    /// Login user.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Password or token.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// When the credential was obtained.
    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Expiry, `None` for static credentials.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the credential is within `margin` of expiry at `now`.
    ///
    /// Always `false` for non-expiring credentials.
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = TimeDelta::from_std(margin).unwrap_or(TimeDelta::MAX);
        self.expires_at.is_some_and(|expires_at| {
            expires_at.checked_sub_signed(margin).is_none_or(|refresh_at| refresh_at <= now)
        })
    }
}

/// Which provider variant is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    /// Fixed user and password.
    Static,
    /// Cloud-issued expiring token.
    Managed,
}

/// Source of database credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync + std::fmt::Debug {
    /// The credential to use for the next physical connection.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialFetchError`] if no credential can be produced.
    async fn current_credential(&self) -> Result<Credential, CredentialFetchError>;

    /// Which variant this is.
    fn kind(&self) -> CredentialKind;
}

/// A fixed credential parsed from a connection string.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credential: Credential,
    connection: tokio_postgres::Config,
}

impl StaticCredentialProvider {
    /// Parses a `postgres://` URL or key/value connection string.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialFetchError::InvalidConnectionString`] if the
    /// string does not parse or lacks a user. A missing password yields an
    /// empty secret for servers that do not ask for one.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, CredentialFetchError> {
        let connection = tokio_postgres::Config::from_str(connection_string)
            .map_err(|e| CredentialFetchError::InvalidConnectionString(e.to_string()))?;
        let user = connection
            .get_user()
            .ok_or_else(|| CredentialFetchError::InvalidConnectionString("missing user".into()))?;
        let password = connection.get_password().unwrap_or_default();
        let password = String::from_utf8(password.to_vec()).map_err(|_| {
            CredentialFetchError::InvalidConnectionString("password is not UTF-8".into())
        })?;

        Ok(Self { credential: Credential::non_expiring(user, password), connection })
    }

    /// The parsed connection target (host, port, database, TLS mode).
    #[must_use]
    pub fn connection_config(&self) -> &tokio_postgres::Config {
        &self.connection
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn current_credential(&self) -> Result<Credential, CredentialFetchError> {
        Ok(self.credential.clone())
    }

    fn kind(&self) -> CredentialKind {
        CredentialKind::Static
    }
}

/// Configuration for [`ManagedCredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
pub struct ManagedCredentialConfig {
    /// Login user; the managed identity's client id.
    #[builder(into)]
    pub principal: String,

    /// Resource scope requested from the issuer.
    #[serde(default = "default_scope")]
    #[builder(into, default = DEFAULT_DATABASE_SCOPE.to_owned())]
    pub scope: String,

    /// Refresh once the token is this close to expiry.
    #[serde(with = "humantime_serde", default = "default_refresh_margin")]
    #[builder(default = DEFAULT_REFRESH_MARGIN)]
    pub refresh_margin: Duration,

    /// Retry policy for a single refresh. Defaults to no retries.
    #[serde(default = "RetryConfig::no_retry")]
    #[builder(default = RetryConfig::no_retry())]
    pub retry: RetryConfig,
}

fn default_scope() -> String {
    DEFAULT_DATABASE_SCOPE.to_owned()
}

fn default_refresh_margin() -> Duration {
    DEFAULT_REFRESH_MARGIN
}

#[derive(Default)]
struct RefreshState {
    /// Refreshes finished so far, successful or not.
    completed: u64,
    /// Outcome of the last refresh, tagged with its completion number.
    last_outcome: Option<(u64, Result<Credential, CredentialFetchError>)>,
}

/// Credentials backed by a [`TokenIssuer`], refreshed on demand.
pub struct ManagedCredentialProvider {
    issuer: Arc<dyn TokenIssuer>,
    config: ManagedCredentialConfig,
    cached: RwLock<Option<Credential>>,
    refresh: tokio::sync::Mutex<RefreshState>,
    refreshes: AtomicU64,
    completed: AtomicU64,
}

impl std::fmt::Debug for ManagedCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedCredentialProvider")
            .field("config", &self.config)
            .field("refresh_count", &self.refresh_count())
            .finish_non_exhaustive()
    }
}

impl ManagedCredentialProvider {
    /// Creates a provider with an empty cache; the first call issues a token.
    #[must_use]
    pub fn new(issuer: Arc<dyn TokenIssuer>, config: ManagedCredentialConfig) -> Self {
        Self {
            issuer,
            config,
            cached: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(RefreshState::default()),
            refreshes: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Number of refreshes started (each may include retries).
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Acquire)
    }

    /// Drops the cached credential so the next call refreshes.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    fn usable_snapshot(&self) -> Option<Credential> {
        let cached = self.cached.read();
        cached
            .as_ref()
            .filter(|c| !c.needs_refresh(Utc::now(), self.config.refresh_margin))
            .cloned()
    }

    async fn issue(&self) -> Result<Credential, CredentialFetchError> {
        let scope = self.config.scope.as_str();
        let issued = with_retry(&self.config.retry, "issue_token", || self.issuer.issue_token(scope))
            .await?;
        Ok(Credential::expiring(self.config.principal.clone(), issued.token, issued.expires_at))
    }
}

#[async_trait]
impl CredentialProvider for ManagedCredentialProvider {
    #[tracing::instrument(skip(self), fields(principal = %self.config.principal))]
    async fn current_credential(&self) -> Result<Credential, CredentialFetchError> {
        if let Some(credential) = self.usable_snapshot() {
            return Ok(credential);
        }

        let observed = self.completed.load(Ordering::Acquire);
        let mut state = self.refresh.lock().await;

        // Another caller may have refreshed while we waited. Its outcome is
        // ours even when the new token already sits inside the margin.
        if let Some(credential) = self.usable_snapshot() {
            return Ok(credential);
        }
        if let Some((completed, outcome)) = &state.last_outcome
            && *completed > observed
        {
            return outcome.clone();
        }

        let attempt = self.refreshes.fetch_add(1, Ordering::AcqRel) + 1;
        let outcome = self.issue().await;
        state.completed += 1;
        self.completed.store(state.completed, Ordering::Release);

        match outcome {
            Ok(credential) => {
                tracing::info!(
                    attempt,
                    expires_at = ?credential.expires_at(),
                    "managed database credential refreshed"
                );
                *self.cached.write() = Some(credential.clone());
                state.last_outcome = Some((state.completed, Ok(credential.clone())));
                Ok(credential)
            },
            Err(error) => {
                tracing::warn!(attempt, error = %error, "managed database credential refresh failed");
                state.last_outcome = Some((state.completed, Err(error.clone())));
                Err(error)
            },
        }
    }

    fn kind(&self) -> CredentialKind {
        CredentialKind::Managed
    }
}

//! Process-wide service wiring.
//!
//! [`AppContext`] is built once at startup and shared by every request. It
//! owns the only [`ConnectionPoolManager`] of the process; nothing connects
//! to the database until the first request needs a connection.

use std::sync::Arc;

use authgate_authn::{
    HttpSessionLookup, IdentityResolver, KeySetCache, SessionLookup, TokenVerifier,
    session::DEFAULT_SESSION_TIMEOUT,
};
use authgate_storage::{
    ConnectionPoolManager, CredentialProvider, ImdsTokenIssuer, ManagedCredentialProvider,
    PgConnector, PgUserStore, PoolStatus, StaticCredentialProvider, TokenIssuer, UserStore,
    issuer::DEFAULT_ISSUE_TIMEOUT,
};
use http::HeaderMap;

use crate::{
    error::{ApiError, InitError},
    settings::{AppConfig, DatabaseCredentials},
    users::{CurrentUser, current_user},
};

/// Shared service state.
#[derive(Clone)]
pub struct AppContext {
    config: Arc<AppConfig>,
    resolver: IdentityResolver,
    pool: Arc<ConnectionPoolManager<PgConnector>>,
    users: Arc<dyn UserStore>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Wires the identity resolver, credential provider, pool and user
    /// store described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`InitError`] if an HTTP client, TLS connector or static
    /// credential cannot be built. No network calls are made.
    pub fn from_config(config: AppConfig) -> Result<Self, InitError> {
        let key_cache = Arc::new(KeySetCache::from_config(&config.auth.key_set)?);
        let verifier = TokenVerifier::new(key_cache).with_leeway(config.auth.leeway);
        let sessions: Arc<dyn SessionLookup> =
            Arc::new(HttpSessionLookup::new(&config.auth.base_url, DEFAULT_SESSION_TIMEOUT)?);
        let resolver = IdentityResolver::new(sessions, verifier, config.auth.base_url.clone());

        let (provider, connector): (Arc<dyn CredentialProvider>, PgConnector) =
            match &config.database.credentials {
                DatabaseCredentials::Static { connection_string } => {
                    let provider = StaticCredentialProvider::from_connection_string(connection_string)?;
                    let connector = PgConnector::new(provider.connection_config().clone(), false)?;
                    (Arc::new(provider), connector)
                },
                DatabaseCredentials::Managed { token_endpoint, host, port, database, credential } => {
                    let issuer: Arc<dyn TokenIssuer> = Arc::new(ImdsTokenIssuer::new(
                        token_endpoint.clone(),
                        Some(credential.principal.clone()),
                        DEFAULT_ISSUE_TIMEOUT,
                    )?);
                    let provider = ManagedCredentialProvider::new(issuer, credential.clone());
                    (Arc::new(provider), PgConnector::managed(host, *port, database)?)
                },
            };

        let pool = Arc::new(ConnectionPoolManager::new(
            connector,
            provider,
            config.database.pool.clone(),
        ));
        let users: Arc<dyn UserStore> =
            Arc::new(PgUserStore::new(Arc::clone(&pool), config.database.pool.acquire_timeout));

        tracing::info!(
            environment = ?config.environment,
            issuer = %config.auth.base_url,
            credentials = pool_credentials(&config.database.credentials),
            "service context ready"
        );
        Ok(Self { config: Arc::new(config), resolver, pool, users })
    }

    /// Replaces the user store; the pool is kept but no longer used for lookups.
    #[must_use]
    pub fn with_user_store(mut self, users: Arc<dyn UserStore>) -> Self {
        self.users = users;
        self
    }

    /// Replaces the identity resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Validated configuration.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Identity resolver.
    #[must_use]
    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// The process-wide connection pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPoolManager<PgConnector>> {
        &self.pool
    }

    /// Pool occupancy.
    #[must_use]
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Resolves the caller and loads their record.
    ///
    /// # Errors
    ///
    /// As [`current_user`].
    pub async fn current_user(&self, headers: &HeaderMap) -> Result<CurrentUser, ApiError> {
        current_user(&self.resolver, self.users.as_ref(), headers).await
    }

    /// Closes the pool.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

fn pool_credentials(credentials: &DatabaseCredentials) -> &'static str {
    match credentials {
        DatabaseCredentials::Static { .. } => "static",
        DatabaseCredentials::Managed { .. } => "managed",
    }
}

//! Shared test utilities for credential and pool testing.
//!
//! In-memory doubles for the external collaborators: a [`TokenIssuer`] that
//! mints numbered tokens, a [`Connector`] that hands out fake connections,
//! and a [`UserStore`] backed by a map. It is feature-gated behind
//! `testutil` to prevent leaking into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! authgate-storage = { path = "../storage", features = ["testutil"] }
//! ```

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::{
    credential::Credential,
    error::{ConnectError, CredentialFetchError, StoreError},
    issuer::{IssuedToken, TokenIssuer},
    pool::Connector,
    users::{UserRecord, UserStore},
};

/// [`TokenIssuer`] that mints `token-<n>` with a fixed lifetime.
#[derive(Debug)]
pub struct MockTokenIssuer {
    lifetime: Duration,
    delay: Option<Duration>,
    failure: Mutex<Option<CredentialFetchError>>,
    fail_first: AtomicUsize,
    calls: AtomicUsize,
}

impl MockTokenIssuer {
    /// Issues tokens valid for `lifetime`.
    #[must_use]
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            delay: None,
            failure: Mutex::new(None),
            fail_first: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleeps for `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fails the first `n` calls with a transient 503.
    #[must_use]
    pub fn failing_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Fails every call with `error` until [`recover`](Self::recover).
    pub fn fail_with(&self, error: CredentialFetchError) {
        *self.failure.lock() = Some(error);
    }

    /// Stops failing.
    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Number of issuance calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for MockTokenIssuer {
    async fn issue_token(&self, _scope: &str) -> Result<IssuedToken, CredentialFetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(CredentialFetchError::Status { status: 503 });
        }
        let lifetime = TimeDelta::from_std(self.lifetime).unwrap_or(TimeDelta::MAX);
        Ok(IssuedToken {
            token: Zeroizing::new(format!("token-{n}")),
            expires_at: Utc::now() + lifetime,
        })
    }
}

/// A connection handed out by [`FakeConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeConnection {
    /// Sequence number of the connection.
    pub id: u64,
    /// User the connection authenticated as.
    pub principal: String,
    /// Secret the connection authenticated with.
    pub secret: String,
}

/// [`Connector`] that opens [`FakeConnection`]s.
#[derive(Debug, Default)]
pub struct FakeConnector {
    delay: Option<Duration>,
    fail_first: AtomicUsize,
    attempts: AtomicUsize,
    next_id: AtomicU64,
    unhealthy: Mutex<HashSet<u64>>,
}

impl FakeConnector {
    /// Connects on every attempt.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` in every connect.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Refuses the first `n` attempts as unreachable.
    #[must_use]
    pub fn failing_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Fails the health check of connection `id` from now on.
    pub fn mark_unhealthy(&self, id: u64) {
        self.unhealthy.lock().insert(id);
    }

    /// Connect attempts, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connections opened.
    #[must_use]
    pub fn connects(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self, credential: &Credential) -> Result<FakeConnection, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(ConnectError::Unreachable {
                message: "connection refused".into(),
                source: None,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeConnection {
            id,
            principal: credential.principal().to_owned(),
            secret: credential.secret().to_owned(),
        })
    }

    async fn is_healthy(&self, connection: &mut FakeConnection) -> bool {
        !self.unhealthy.lock().contains(&connection.id)
    }
}

/// [`UserStore`] backed by a map.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, UserRecord>>,
    failure: Mutex<Option<String>>,
}

impl MemoryUserStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a user.
    pub fn insert(&self, user: UserRecord) {
        self.users.lock().insert(user.id.clone(), user);
    }

    /// Fails every lookup with a query error.
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock() = Some(message.to_owned());
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(StoreError::Query { message, source: None });
        }
        Ok(self.users.lock().get(id).cloned())
    }
}

/// A user record with predictable fields.
#[must_use]
pub fn user(id: &str) -> UserRecord {
    UserRecord {
        id: id.to_owned(),
        name: format!("User {id}"),
        email: format!("{id}@example.com"),
        role: Some("user".to_owned()),
    }
}

//! Cached, single-flight access to a remotely published key set (JWKS).
//!
//! # Architecture
//!
//! ```text
//! JWT arrives → extract kid
//!              → cached set fresh? look up kid
//!              → set absent or TTL elapsed? fetch (single-flight)
//!              → kid unknown? refetch once (single-flight), look up again
//!              → still unknown? UnknownKey
//! ```
//!
//! # Single-flight
//!
//! The first caller that needs a new set spawns the fetch on the runtime and
//! parks a shared handle in the cache state. Every concurrent caller awaits
//! that same handle, so N simultaneous misses cost one outbound request. The
//! fetch runs as its own task: a caller that gives up (deadline, cancelled
//! request) abandons only its wait, and the fetch still completes and
//! populates the cache.
//!
//! A caller whose stale set has already been replaced by someone else's fetch
//! uses the replacement instead of fetching again.
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//! use authgate_authn::{KeySetCache, KeySetCacheConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = KeySetCacheConfig::builder()
//!     .base_url("https://auth.example.com")
//!     .ttl(Duration::from_secs(300))
//!     .build();
//! let cache = KeySetCache::from_config(&config)?;
//! let key = cache.get_key("key-2024-001").await?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use fail::fail_point;
use futures::future::{BoxFuture, FutureExt, Shared};
use jsonwebtoken::{
    Algorithm, DecodingKey,
    jwk::{Jwk, JwkSet, KeyAlgorithm, PublicKeyUse},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{KeyFetchError, VerificationError};

/// Default key-set TTL (5 minutes).
pub const DEFAULT_KEY_SET_TTL: Duration = Duration::from_secs(300);

/// Default path of the key-set document relative to the issuer base URL.
pub const DEFAULT_JWKS_PATH: &str = "/api/auth/jwks";

/// Default timeout of a single key-set HTTP request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of the remote key-set document.
#[async_trait]
pub trait KeySetFetcher: Send + Sync + 'static {
    /// Retrieves the current key set.
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError>;
}

/// Fetches the key set over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpKeySetFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySetFetcher {
    /// Creates a fetcher for `url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`KeyFetchError::Transport`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, KeyFetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeyFetchError::transport("failed to build HTTP client", e))?;
        Ok(Self::with_client(client, url))
    }

    /// Creates a fetcher reusing an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }

    /// Returns the key-set URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| KeyFetchError::transport(format!("GET {}", self.url), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeyFetchError::Status { status: status.as_u16() });
        }

        response.json::<JwkSet>().await.map_err(|e| KeyFetchError::invalid_document(e.to_string()))
    }
}

/// A public key from the set, ready for signature verification.
pub struct VerificationKey {
    key: DecodingKey,
    algorithm: Option<Algorithm>,
}

impl VerificationKey {
    /// Returns the decoding key.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }

    /// Algorithm the key set declares for this key, if any.
    #[must_use]
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey").field("algorithm", &self.algorithm).finish_non_exhaustive()
    }
}

/// A fetched key set, keyed by `kid`.
#[derive(Debug)]
pub struct SigningKeySet {
    keys: HashMap<String, Arc<VerificationKey>>,
    fetched_at: Instant,
    ttl: Duration,
}

impl SigningKeySet {
    /// Builds a set from a JWKS document.
    ///
    /// Keys without a `kid`, keys marked for encryption, and keys that cannot
    /// be converted to a decoding key are skipped with a warning.
    #[must_use]
    pub fn from_jwks(jwks: &JwkSet, ttl: Duration) -> Self {
        let keys = jwks.keys.iter().filter_map(to_verification_key).collect();
        Self { keys, fetched_at: Instant::now(), ttl }
    }

    /// Looks up a key by id.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        self.keys.get(kid).cloned()
    }

    /// Whether the set is still within its TTL.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }

    /// When the set was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    /// Number of usable keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no usable key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Configuration for [`KeySetCache::from_config`].
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
pub struct KeySetCacheConfig {
    /// Issuer base URL; the key set lives at `base_url + jwks_path`.
    #[builder(into)]
    pub base_url: String,

    /// Path of the key-set document.
    #[serde(default = "default_jwks_path")]
    #[builder(into, default = DEFAULT_JWKS_PATH.to_owned())]
    pub jwks_path: String,

    /// How long a fetched set is considered fresh.
    #[serde(with = "humantime_serde", default = "default_ttl")]
    #[builder(default = DEFAULT_KEY_SET_TTL)]
    pub ttl: Duration,

    /// Timeout of a single key-set request.
    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    #[builder(default = DEFAULT_FETCH_TIMEOUT)]
    pub fetch_timeout: Duration,
}

fn default_jwks_path() -> String {
    DEFAULT_JWKS_PATH.to_owned()
}

fn default_ttl() -> Duration {
    DEFAULT_KEY_SET_TTL
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

impl KeySetCacheConfig {
    /// Full URL of the key-set document.
    #[must_use]
    pub fn jwks_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.jwks_path)
    }
}

type FetchOutcome = Result<Arc<SigningKeySet>, KeyFetchError>;
type InflightFetch = Shared<BoxFuture<'static, FetchOutcome>>;

#[derive(Default)]
struct CacheState {
    current: Option<Arc<SigningKeySet>>,
    /// In-flight fetch, tagged with its sequence number so only the fetch
    /// that installed it may clear it.
    inflight: Option<(u64, InflightFetch)>,
}

/// Process-wide cache of the issuer's public keys.
pub struct KeySetCache {
    fetcher: Arc<dyn KeySetFetcher>,
    ttl: Duration,
    state: Arc<Mutex<CacheState>>,
    fetch_seq: AtomicU64,
}

impl std::fmt::Debug for KeySetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySetCache")
            .field("ttl", &self.ttl)
            .field("fetch_count", &self.fetch_count())
            .finish_non_exhaustive()
    }
}

impl KeySetCache {
    /// Creates an empty cache; the first lookup triggers a fetch.
    #[must_use]
    pub fn new(fetcher: Arc<dyn KeySetFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            state: Arc::new(Mutex::new(CacheState::default())),
            fetch_seq: AtomicU64::new(0),
        }
    }

    /// Creates a cache backed by [`HttpKeySetFetcher`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &KeySetCacheConfig) -> Result<Self, KeyFetchError> {
        let fetcher = HttpKeySetFetcher::new(config.jwks_url(), config.fetch_timeout)?;
        Ok(Self::new(Arc::new(fetcher), config.ttl))
    }

    /// Returns the verification key for `kid`.
    ///
    /// Fetches the set when none is cached or its TTL has elapsed. If `kid`
    /// is missing from a set that was already cached, one refetch is made
    /// before giving up.
    ///
    /// # Errors
    ///
    /// - [`VerificationError::KeyFetchFailed`] if a required fetch fails
    /// - [`VerificationError::UnknownKey`] if `kid` is absent after refetching
    #[tracing::instrument(skip(self))]
    pub async fn get_key(&self, kid: &str) -> Result<Arc<VerificationKey>, VerificationError> {
        let (set, fetched_now) = self.current_or_fetch().await?;
        if let Some(key) = set.get(kid) {
            return Ok(key);
        }
        if fetched_now {
            return Err(VerificationError::unknown_key(kid));
        }

        tracing::debug!(kid, "kid not in cached key set, refetching");
        let refreshed = self.refresh(Some(&set)).await?;
        refreshed.get(kid).ok_or_else(|| VerificationError::unknown_key(kid))
    }

    /// Drops the cached set so the next lookup fetches.
    pub fn invalidate(&self) {
        self.state.lock().current = None;
        tracing::info!("key set cache invalidated");
    }

    /// Number of fetches started since construction.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetch_seq.load(Ordering::Acquire)
    }

    /// Number of keys in the cached set (0 when nothing is cached).
    #[must_use]
    pub fn cached_key_count(&self) -> usize {
        self.state.lock().current.as_ref().map_or(0, |set| set.len())
    }

    /// Returns a fresh set, fetching if needed. The flag reports whether
    /// this call had to wait on a fetch.
    async fn current_or_fetch(&self) -> Result<(Arc<SigningKeySet>, bool), KeyFetchError> {
        let stale = {
            let state = self.state.lock();
            match &state.current {
                Some(set) if set.is_fresh() => return Ok((Arc::clone(set), false)),
                other => other.clone(),
            }
        };
        let set = self.refresh(stale.as_ref()).await?;
        Ok((set, true))
    }

    /// Replaces `stale` with a newly fetched set, joining any fetch already
    /// in flight.
    async fn refresh(&self, stale: Option<&Arc<SigningKeySet>>) -> FetchOutcome {
        let inflight = {
            let mut state = self.state.lock();
            if let Some(current) = &state.current
                && stale.is_none_or(|s| !Arc::ptr_eq(s, current))
                && current.is_fresh()
            {
                return Ok(Arc::clone(current));
            }
            match &state.inflight {
                Some((_, fetch)) => fetch.clone(),
                None => {
                    let (seq, fetch) = self.spawn_fetch();
                    state.inflight = Some((seq, fetch.clone()));
                    fetch
                },
            }
        };
        inflight.await
    }

    /// Spawns the fetch task. Must be called with the state lock held so the
    /// task cannot clear `inflight` before it is installed.
    fn spawn_fetch(&self) -> (u64, InflightFetch) {
        let seq = self.fetch_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let fetcher = Arc::clone(&self.fetcher);
        let state = Arc::clone(&self.state);
        let ttl = self.ttl;

        let handle = tokio::spawn(async move {
            let outcome = fetch_key_set(fetcher.as_ref(), ttl).await;
            let mut guard = state.lock();
            if matches!(&guard.inflight, Some((current, _)) if *current == seq) {
                guard.inflight = None;
            }
            match &outcome {
                Ok(set) => {
                    tracing::info!(fetch = seq, keys = set.len(), "key set refreshed");
                    guard.current = Some(Arc::clone(set));
                },
                Err(e) => tracing::warn!(fetch = seq, error = %e, "key set fetch failed"),
            }
            outcome
        });

        let state = Arc::clone(&self.state);
        let fetch = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let mut guard = state.lock();
                    if matches!(&guard.inflight, Some((current, _)) if *current == seq) {
                        guard.inflight = None;
                    }
                    Err(KeyFetchError::Aborted(join_error.to_string()))
                },
            }
        }
        .boxed()
        .shared();

        (seq, fetch)
    }
}

async fn fetch_key_set(fetcher: &dyn KeySetFetcher, ttl: Duration) -> FetchOutcome {
    fail_point!("key-set-before-fetch", |_| {
        Err(KeyFetchError::Aborted("injected failure before key set fetch".into()))
    });
    let jwks = fetcher.fetch().await?;
    let set = SigningKeySet::from_jwks(&jwks, ttl);
    if set.is_empty() && !jwks.keys.is_empty() {
        return Err(KeyFetchError::invalid_document("no usable signing keys in key set"));
    }
    Ok(Arc::new(set))
}

fn to_verification_key(jwk: &Jwk) -> Option<(String, Arc<VerificationKey>)> {
    let Some(kid) = jwk.common.key_id.clone() else {
        tracing::warn!("skipping JWK without kid");
        return None;
    };
    if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
        tracing::debug!(kid, "skipping encryption JWK");
        return None;
    }
    match DecodingKey::from_jwk(jwk) {
        Ok(key) => {
            let algorithm = jwk.common.key_algorithm.clone().and_then(signing_algorithm);
            Some((kid, Arc::new(VerificationKey { key, algorithm })))
        },
        Err(e) => {
            tracing::warn!(kid, error = %e, "skipping unusable JWK");
            None
        },
    }
}

fn signing_algorithm(alg: KeyAlgorithm) -> Option<Algorithm> {
    match alg {
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        _ => None,
    }
}

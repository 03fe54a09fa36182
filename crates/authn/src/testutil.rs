//! Shared test utilities for authentication testing.
//!
//! This module provides Ed25519 key pairs that publish themselves as JWKs,
//! token signing helpers, raw JWT crafting (for attack testing), and
//! in-memory [`KeySetFetcher`] and [`SessionLookup`] doubles that count
//! their calls. It is feature-gated behind `testutil` to prevent leaking
//! into production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! authgate-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use authgate_authn::testutil::{TestKeyPair, jwk_set, standard_claims};
//!
//! let key = TestKeyPair::generate("kid-1");
//! let token = key.sign(&standard_claims("http://localhost:3000", "http://localhost:3000", "user-1", 3600));
//! let jwks = jwk_set(&[&key]);
//! ```

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use http::HeaderMap;
use jsonwebtoken::{Algorithm, EncodingKey, Header, jwk::JwkSet};
use parking_lot::Mutex;
use rand_core::OsRng;
use serde_json::{Value, json};
use zeroize::Zeroizing;

use crate::{
    error::{KeyFetchError, SessionLookupError},
    key_set_cache::KeySetFetcher,
    session::{Session, SessionLookup},
};

/// An Ed25519 signing key with its `kid`.
pub struct TestKeyPair {
    kid: String,
    pkcs8_der: Zeroizing<Vec<u8>>,
    public_key_b64: String,
}

impl std::fmt::Debug for TestKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestKeyPair").field("kid", &self.kid).finish_non_exhaustive()
    }
}

impl TestKeyPair {
    /// Generates a fresh random key pair.
    #[must_use]
    pub fn generate(kid: &str) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

        let private_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
        let mut pkcs8_der = Zeroizing::new(vec![
            0x30, 0x2e, // SEQUENCE, 46 bytes
            0x02, 0x01, 0x00, // INTEGER version 0
            0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
            0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
            0x04, 0x22, // OCTET STRING, 34 bytes
            0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
        ]);
        pkcs8_der.extend_from_slice(&*private_bytes);

        Self { kid: kid.to_owned(), pkcs8_der, public_key_b64 }
    }

    /// Key id.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public half as a JWK object.
    #[must_use]
    pub fn jwk_json(&self) -> Value {
        json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "x": self.public_key_b64,
            "kid": self.kid,
            "alg": "EdDSA",
            "use": "sig",
        })
    }

    /// Signs `claims` as an EdDSA JWT with this key's `kid`.
    ///
    /// # Panics
    ///
    /// Panics if JWT encoding fails (should not happen with valid inputs).
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        let encoding_key = EncodingKey::from_ed_der(&self.pkcs8_der);
        jsonwebtoken::encode(&header, claims, &encoding_key).expect("Failed to encode test JWT")
    }
}

/// Builds a key-set document publishing `keys`.
///
/// # Panics
///
/// Panics if the generated JWKs do not deserialize.
#[must_use]
#[allow(clippy::expect_used)]
pub fn jwk_set(keys: &[&TestKeyPair]) -> JwkSet {
    let keys: Vec<Value> = keys.iter().map(|k| k.jwk_json()).collect();
    serde_json::from_value(json!({ "keys": keys })).expect("valid JWK set")
}

/// Claims the verifier requires, expiring `expires_in_secs` from now
/// (negative for an already-expired token).
#[must_use]
pub fn standard_claims(issuer: &str, audience: &str, subject: &str, expires_in_secs: i64) -> Value {
    let now = Utc::now().timestamp();
    json!({
        "iss": issuer,
        "aud": audience,
        "sub": subject,
        "iat": now,
        "exp": now + expires_in_secs,
        "email": format!("{subject}@example.com"),
        "name": "Test User",
        "role": "user",
    })
}

/// Creates a raw JWT string from arbitrary header and payload JSON.
///
/// The resulting JWT has the structure `{header_b64}.{payload_b64}.`
/// with an empty signature. This is useful for testing rejection of
/// malformed or attack JWTs (e.g., `alg: "none"`, algorithm confusion).
///
/// # Panics
///
/// Panics if JSON serialization fails.
#[must_use]
#[allow(clippy::expect_used)]
pub fn craft_raw_jwt(header_json: &Value, payload_json: &Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{header_b64}.{payload_b64}.")
}

/// In-memory [`KeySetFetcher`] with a call counter, optional latency and
/// switchable failure.
#[derive(Debug)]
pub struct MockKeySetFetcher {
    response: Mutex<Result<JwkSet, KeyFetchError>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockKeySetFetcher {
    /// Serves `key_set` on every fetch.
    #[must_use]
    pub fn new(key_set: JwkSet) -> Self {
        Self { response: Mutex::new(Ok(key_set)), delay: None, calls: AtomicUsize::new(0) }
    }

    /// Sleeps for `delay` before answering each fetch.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Serves `key_set` from now on, clearing any failure.
    pub fn set_key_set(&self, key_set: JwkSet) {
        *self.response.lock() = Ok(key_set);
    }

    /// Fails every subsequent fetch with `error`.
    pub fn fail_with(&self, error: KeyFetchError) {
        *self.response.lock() = Err(error);
    }

    /// Number of fetches started so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySetFetcher for MockKeySetFetcher {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response.lock().clone()
    }
}

/// In-memory [`SessionLookup`] returning a fixed answer.
#[derive(Debug)]
pub struct MockSessionLookup {
    response: Mutex<Result<Option<Session>, String>>,
    calls: AtomicUsize,
}

impl MockSessionLookup {
    /// Never finds a session.
    #[must_use]
    pub fn none() -> Self {
        Self { response: Mutex::new(Ok(None)), calls: AtomicUsize::new(0) }
    }

    /// Always returns a live session for `user_id`.
    #[must_use]
    pub fn with_user(user_id: &str) -> Self {
        let session = Session {
            session_id: format!("session-{user_id}"),
            user_id: user_id.to_owned(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        Self { response: Mutex::new(Ok(Some(session))), calls: AtomicUsize::new(0) }
    }

    /// Always fails with a backend error.
    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self { response: Mutex::new(Err(message.to_owned())), calls: AtomicUsize::new(0) }
    }

    /// Number of lookups so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionLookup for MockSessionLookup {
    async fn get_session(&self, _headers: &HeaderMap) -> Result<Option<Session>, SessionLookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.lock().clone().map_err(SessionLookupError::Backend)
    }
}

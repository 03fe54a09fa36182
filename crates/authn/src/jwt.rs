//! Bearer-token verification against the cached key set.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use authgate_authn::{KeySetCache, KeySetCacheConfig, TokenVerifier};
//!
//! # async fn example(token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let config = KeySetCacheConfig::builder().base_url("https://auth.example.com").build();
//! let verifier = TokenVerifier::new(Arc::new(KeySetCache::from_config(&config)?));
//!
//! let claims = verifier
//!     .verify(token, "https://auth.example.com", "https://auth.example.com")
//!     .await?;
//! println!("subject: {:?}", claims.subject());
//! # Ok(())
//! # }
//! ```

use std::{sync::Arc, time::Duration};

use jsonwebtoken::{Header, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{Result, VerificationError},
    key_set_cache::KeySetCache,
    validation::{validate_algorithm, validate_kid},
};

/// Verified token claims.
///
/// Holds every claim from the payload; typed accessors cover the registered
/// claims the resolver relies on. Issuer-specific claims (`name`, `email`,
/// `role`, ...) are available through [`get`](Self::get).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// `sub` claim.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.0.get("sub").and_then(Value::as_str)
    }

    /// `iss` claim.
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.0.get("iss").and_then(Value::as_str)
    }

    /// `exp` claim, seconds since epoch.
    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        self.0.get("exp").and_then(Value::as_i64)
    }

    /// Any claim by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Borrow the full claim map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume into the claim map.
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Claims {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Decode the JWT header without verification.
///
/// # Errors
///
/// Returns [`VerificationError::Malformed`] if the header cannot be decoded.
pub fn decode_jwt_header(token: &str) -> Result<Header> {
    decode_header(token)
        .map_err(|e| VerificationError::malformed(format!("Failed to decode JWT header: {e}")))
}

/// Verifies bearer tokens: signature, `exp`, `nbf`, `iss`, `aud`.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    key_cache: Arc<KeySetCache>,
    leeway: Duration,
}

impl TokenVerifier {
    /// Creates a verifier with zero clock leeway.
    #[must_use]
    pub fn new(key_cache: Arc<KeySetCache>) -> Self {
        Self { key_cache, leeway: Duration::ZERO }
    }

    /// Sets the clock leeway applied to `exp` and `nbf`.
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// The shared key-set cache.
    #[must_use]
    pub fn key_cache(&self) -> &Arc<KeySetCache> {
        &self.key_cache
    }

    /// Verify `token` and return its claims.
    ///
    /// 1. Decode the header; require a well-formed `kid` and an accepted algorithm
    /// 2. Resolve the key through the [`KeySetCache`] (may fetch or refetch once)
    /// 3. Verify the signature pinned to the header algorithm
    /// 4. Require `exp`, `iss`, `aud`, `sub`; check `iss` and `aud` for exact match
    ///
    /// # Errors
    ///
    /// Any [`VerificationError`]; the caller decides how much of it to expose.
    #[tracing::instrument(skip(self, token))]
    pub async fn verify(&self, token: &str, issuer: &str, audience: &str) -> Result<Claims> {
        let header = decode_jwt_header(token)?;
        let kid = header.kid.as_deref().ok_or(VerificationError::MissingKeyId)?;
        validate_kid(kid)?;
        validate_algorithm(&format!("{:?}", header.alg))?;

        let key = self.key_cache.get_key(kid).await?;
        if let Some(declared) = key.algorithm()
            && declared != header.alg
        {
            return Err(VerificationError::UnsupportedAlgorithm(format!(
                "token algorithm {:?} does not match key algorithm {declared:?}",
                header.alg
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let data = decode::<Claims>(token, key.decoding_key(), &validation)?;

        tracing::debug!(kid, "token verified");
        Ok(data.claims)
    }
}

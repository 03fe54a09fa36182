//! # authgate authentication
//!
//! Resolves the caller of an incoming request.
//!
//! This crate provides:
//! - **Identity resolution**: session lookup first, bearer token second
//! - **Token verification**: signature, expiry, issuer and audience checks
//! - **Key-set cache**: TTL-bound JWKS cache with single-flight refetch
//! - **Algorithm validation**: Security checks for JWT algorithms
//!
//! ## Features
//!
//! - Only asymmetric algorithms (EdDSA, ECDSA, RSA, RSA-PSS) are supported
//! - Symmetric algorithms (HS256, etc.) and `none` are explicitly rejected
//! - Concurrent unknown-key misses share one outbound key-set fetch
//! - Failure details are logged, never returned to the caller
//!
//! ## Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use authgate_authn::{
//!     HttpSessionLookup, IdentityResolver, KeySetCache, KeySetCacheConfig, TokenVerifier,
//! };
//!
//! # async fn example(headers: http::HeaderMap) -> Result<(), Box<dyn std::error::Error>> {
//! let base_url = "https://auth.example.com";
//! let cache = KeySetCache::from_config(&KeySetCacheConfig::builder().base_url(base_url).build())?;
//! let sessions = HttpSessionLookup::new(base_url, Duration::from_secs(5))?;
//! let resolver =
//!     IdentityResolver::new(Arc::new(sessions), TokenVerifier::new(Arc::new(cache)), base_url);
//!
//! let identity = resolver.resolve(&headers).await?;
//! println!("caller: {} via {:?}", identity.user_id(), identity.provenance());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Authentication error types.
pub mod error;
/// Caller identity resolution.
pub mod identity;
/// Bearer-token verification and claims.
pub mod jwt;
/// JWKS cache with single-flight refetch.
pub mod key_set_cache;
/// Session lookup collaborator.
pub mod session;
/// Shared test utilities (requires the `testutil` feature).
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
/// Algorithm validation.
pub mod validation;

// Re-export key types for convenience
pub use error::{AuthFailure, KeyFetchError, Result, SessionLookupError, VerificationError};
pub use identity::{Identity, IdentityResolver, Provenance, bearer_token, token_prefix};
pub use jwt::{Claims, TokenVerifier};
pub use key_set_cache::{
    DEFAULT_JWKS_PATH, DEFAULT_KEY_SET_TTL, HttpKeySetFetcher, KeySetCache, KeySetCacheConfig,
    KeySetFetcher, SigningKeySet, VerificationKey,
};
pub use session::{HttpSessionLookup, Session, SessionLookup};
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};

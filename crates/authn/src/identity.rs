//! Caller identity resolution.
//!
//! A request is authenticated by its session cookie when the auth provider
//! recognises one, and otherwise by a bearer token verified against the
//! provider's published key set. Every failure collapses into
//! [`AuthFailure::Unauthenticated`]; the precise reason is only logged.

use std::sync::Arc;

use http::{HeaderMap, header};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::{
    error::AuthFailure,
    jwt::{Claims, TokenVerifier},
    session::SessionLookup,
};

/// Number of token characters kept in log output.
pub const TOKEN_PREFIX_LEN: usize = 8;

/// How an [`Identity`] was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// Stateful session held by the auth provider.
    Session,
    /// Self-contained bearer token.
    Token,
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    user_id: String,
    provenance: Provenance,
    claims: Option<Map<String, Value>>,
}

impl Identity {
    /// Identity established by a session. Carries no claims.
    #[must_use]
    pub fn from_session(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), provenance: Provenance::Session, claims: None }
    }

    /// Identity established by a verified token.
    #[must_use]
    pub fn from_token(user_id: impl Into<String>, claims: Claims) -> Self {
        Self {
            user_id: user_id.into(),
            provenance: Provenance::Token,
            claims: Some(claims.into_map()),
        }
    }

    /// User id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// How the identity was established.
    #[must_use]
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Token claims; `None` for session identities.
    #[must_use]
    pub fn claims(&self) -> Option<&Map<String, Value>> {
        self.claims.as_ref()
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
///
/// The scheme is matched case-insensitively. Returns `None` for a missing
/// header, a non-UTF-8 value, another scheme, or an empty token.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    if token.is_empty() || token.contains(char::is_whitespace) {
        return None;
    }
    Some(token)
}

/// Loggable prefix of a token.
///
/// Keeps at most [`TOKEN_PREFIX_LEN`] characters and never more than half of
/// the token, so short tokens are not logged whole.
#[must_use]
pub fn token_prefix(token: &str) -> String {
    let keep = TOKEN_PREFIX_LEN.min(token.chars().count() / 2);
    let mut prefix: String = token.chars().take(keep).collect();
    prefix.push('…');
    prefix
}

/// Resolves the caller of a request from its headers.
#[derive(Clone)]
pub struct IdentityResolver {
    sessions: Arc<dyn SessionLookup>,
    verifier: TokenVerifier,
    base_url: String,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("verifier", &self.verifier)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    /// Creates a resolver. `base_url` is both the expected issuer and audience.
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionLookup>,
        verifier: TokenVerifier,
        base_url: impl Into<String>,
    ) -> Self {
        Self { sessions, verifier, base_url: base_url.into() }
    }

    /// The token verifier.
    #[must_use]
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Resolve the caller.
    ///
    /// # Errors
    ///
    /// Returns [`AuthFailure::Unauthenticated`] when there is neither a
    /// valid session nor a verifiable bearer token.
    #[tracing::instrument(skip_all)]
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Identity, AuthFailure> {
        match self.sessions.get_session(headers).await {
            Ok(Some(session)) => {
                tracing::debug!(user_id = %session.user_id, "resolved session identity");
                return Ok(Identity::from_session(session.user_id));
            },
            Ok(None) => {},
            Err(e) => tracing::warn!(error = %e, "session lookup failed; trying bearer token"),
        }

        let Some(token) = bearer_token(headers) else {
            return Err(AuthFailure::Unauthenticated);
        };

        match self.verifier.verify(token, &self.base_url, &self.base_url).await {
            Ok(claims) => {
                // `sub` is a required claim, so verification guarantees it.
                let Some(user_id) = claims.subject().map(str::to_owned) else {
                    return Err(AuthFailure::Unauthenticated);
                };
                tracing::debug!(user_id = %user_id, "resolved token identity");
                Ok(Identity::from_token(user_id, claims))
            },
            Err(e) => {
                tracing::warn!(
                    token_prefix = %token_prefix(token),
                    kind = e.kind(),
                    "bearer token rejected"
                );
                Err(AuthFailure::Unauthenticated)
            },
        }
    }

    /// [`resolve`](Self::resolve) bounded by a request deadline.
    ///
    /// Key-set fetches run on their own task, so an expired deadline only
    /// abandons the wait; the fetch still completes and fills the cache.
    ///
    /// # Errors
    ///
    /// Returns [`AuthFailure::Unauthenticated`] on failure or when the
    /// deadline passes first.
    pub async fn resolve_with_deadline(
        &self,
        headers: &HeaderMap,
        deadline: Instant,
    ) -> Result<Identity, AuthFailure> {
        match tokio::time::timeout_at(deadline, self.resolve(headers)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("identity resolution timed out");
                Err(AuthFailure::Unauthenticated)
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, value.parse().expect("header value"));
        headers
    }

    #[rstest]
    #[case("Bearer abc.def.ghi", Some("abc.def.ghi"))]
    #[case("bearer abc", Some("abc"))]
    #[case("BEARER abc", Some("abc"))]
    #[case("Basic dXNlcjpwYXNz", None)]
    #[case("Bearer", None)]
    #[case("Bearer ", None)]
    #[case("Bearer a b", None)]
    #[case("Bearerabc", None)]
    fn test_bearer_token_parsing(#[case] value: &str, #[case] expected: Option<&str>) {
        let headers = headers_with_auth(value);
        assert_eq!(bearer_token(&headers), expected);
    }

    #[test]
    fn test_bearer_token_absent() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[rstest]
    #[case("malformed.token", "malform…")]
    #[case("eyJhbGciOiJFZERTQSJ9.payload.sig", "eyJhbGci…")]
    #[case("abcd", "ab…")]
    #[case("a", "…")]
    #[case("", "…")]
    fn test_token_prefix(#[case] token: &str, #[case] expected: &str) {
        assert_eq!(token_prefix(token), expected);
    }

    #[test]
    fn test_token_prefix_never_contains_whole_token() {
        for token in ["x", "xy", "abc.def", "malformed.token", "a.b.c.d.e.f.g.h.i.j"] {
            let prefix = token_prefix(token);
            assert!(!prefix.contains(token), "prefix {prefix:?} leaks {token:?}");
        }
    }

    #[test]
    fn test_identity_constructors_enforce_claims_invariant() {
        let session = Identity::from_session("u1");
        assert_eq!(session.provenance(), Provenance::Session);
        assert!(session.claims().is_none());

        let claims: Claims =
            serde_json::from_value(serde_json::json!({ "sub": "u2" })).expect("claims");
        let token = Identity::from_token("u2", claims);
        assert_eq!(token.provenance(), Provenance::Token);
        assert_eq!(token.user_id(), "u2");
        assert_eq!(token.claims().and_then(|c| c.get("sub")), Some(&serde_json::json!("u2")));
    }
}

//! Cloud identity token issuance.
//!
//! A [`TokenIssuer`] exchanges the workload's managed identity for a
//! short-lived access token scoped to the database resource.
//! [`ImdsTokenIssuer`] talks to the instance metadata service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::CredentialFetchError;

/// Instance metadata service token endpoint.
pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// API version sent to the metadata service.
pub const IMDS_API_VERSION: &str = "2018-02-01";

/// Default request timeout for token issuance.
pub const DEFAULT_ISSUE_TIMEOUT: Duration = Duration::from_secs(10);

/// An access token and its expiry.
#[derive(Clone)]
pub struct IssuedToken {
    /// The bearer token.
    pub token: Zeroizing<String>,
    /// Absolute expiry.
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// External token-issuance capability.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Issue a token for `scope` (for example `https://ossrdbms-aad.database.windows.net/.default`).
    async fn issue_token(&self, scope: &str) -> Result<IssuedToken, CredentialFetchError>;
}

/// [`TokenIssuer`] backed by the instance metadata service.
#[derive(Debug, Clone)]
pub struct ImdsTokenIssuer {
    client: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
}

impl ImdsTokenIssuer {
    /// Creates an issuer for the user-assigned identity `client_id`, or the
    /// system-assigned identity when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialFetchError::Transport`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        client_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CredentialFetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialFetchError::transport("build HTTP client", e))?;
        Ok(Self { client, endpoint: endpoint.into(), client_id })
    }

    /// Token endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// The metadata service returns `expires_on` as a string, some hosts as a number.
#[derive(Deserialize)]
#[serde(untagged)]
enum EpochSeconds {
    Number(i64),
    Text(String),
}

impl EpochSeconds {
    fn parse(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_on: EpochSeconds,
}

/// Strips the `/.default` suffix: the metadata service wants a resource, not a scope.
fn resource_for_scope(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

#[async_trait]
impl TokenIssuer for ImdsTokenIssuer {
    #[tracing::instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn issue_token(&self, scope: &str) -> Result<IssuedToken, CredentialFetchError> {
        let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", resource_for_scope(scope))];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await
            .map_err(|e| CredentialFetchError::transport("token request", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialFetchError::Status { status: status.as_u16() });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CredentialFetchError::transport("token response body", e))?;
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| CredentialFetchError::invalid_response(e.to_string()))?;

        let expires_at = parsed
            .expires_on
            .parse()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| CredentialFetchError::invalid_response("unreadable expires_on"))?;

        tracing::debug!(expires_at = %expires_at, "issued database access token");
        Ok(IssuedToken { token: Zeroizing::new(parsed.access_token), expires_at })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_for_scope() {
        assert_eq!(
            resource_for_scope("https://ossrdbms-aad.database.windows.net/.default"),
            "https://ossrdbms-aad.database.windows.net"
        );
        assert_eq!(resource_for_scope("https://example.com"), "https://example.com");
    }

    #[test]
    fn test_expires_on_accepts_string_or_number() {
        let text: TokenResponse =
            serde_json::from_str(r#"{ "access_token": "t", "expires_on": "1700000000" }"#)
                .expect("string form");
        assert_eq!(text.expires_on.parse(), Some(1_700_000_000));

        let number: TokenResponse =
            serde_json::from_str(r#"{ "access_token": "t", "expires_on": 1700000000 }"#)
                .expect("number form");
        assert_eq!(number.expires_on.parse(), Some(1_700_000_000));
    }

    #[test]
    fn test_issued_token_debug_redacts() {
        let token = IssuedToken {
            token: Zeroizing::new("super-secret".into()),
            expires_at: Utc::now(),
        };
        assert!(!format!("{token:?}").contains("super-secret"));
    }
}

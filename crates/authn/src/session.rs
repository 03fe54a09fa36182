//! Stateful session lookup.
//!
//! The auth provider owns sessions; this module only asks it whether the
//! incoming request carries a valid one.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{HeaderMap, header};
use serde::Deserialize;

use crate::error::SessionLookupError;

/// Path of the provider's session endpoint, relative to its base URL.
pub const SESSION_PATH: &str = "/api/auth/get-session";

/// Default request timeout for session lookups.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// A live session as reported by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Provider session id.
    pub session_id: String,
    /// Owning user.
    pub user_id: String,
    /// Absolute expiry.
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Whether the session is still valid at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// External session-verification capability.
///
/// Implementations receive the raw request headers. `Ok(None)` means the
/// request has no valid session; errors are recovered by the caller.
#[async_trait]
pub trait SessionLookup: Send + Sync {
    /// Look up the session attached to `headers`.
    async fn get_session(&self, headers: &HeaderMap) -> Result<Option<Session>, SessionLookupError>;
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    session: SessionRecord,
    user: UserRecord,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    id: String,
    user_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    id: String,
}

/// [`SessionLookup`] backed by the provider's `get-session` HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpSessionLookup {
    client: reqwest::Client,
    url: String,
}

impl HttpSessionLookup {
    /// Creates a lookup against `<base_url>/api/auth/get-session`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionLookupError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SessionLookupError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SessionLookupError::Transport)?;
        Ok(Self::with_client(client, base_url))
    }

    /// Creates a lookup using an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self { client, url: format!("{}{SESSION_PATH}", base_url.trim_end_matches('/')) }
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SessionLookup for HttpSessionLookup {
    #[tracing::instrument(skip(self, headers), fields(url = %self.url))]
    async fn get_session(&self, headers: &HeaderMap) -> Result<Option<Session>, SessionLookupError> {
        // Sessions travel in cookies only.
        let Some(cookie) = headers.get(header::COOKIE) else {
            return Ok(None);
        };

        let mut request = self.client.get(&self.url).header(header::COOKIE, cookie);
        if let Some(authorization) = headers.get(header::AUTHORIZATION) {
            request = request.header(header::AUTHORIZATION, authorization);
        }

        let response = request.send().await.map_err(SessionLookupError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SessionLookupError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(SessionLookupError::Transport)?;
        let payload: Option<SessionPayload> = serde_json::from_slice(&body)
            .map_err(|e| SessionLookupError::InvalidPayload(e.to_string()))?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        if payload.session.user_id != payload.user.id {
            return Err(SessionLookupError::InvalidPayload(
                "session user does not match user record".into(),
            ));
        }

        let session = Session {
            session_id: payload.session.id,
            user_id: payload.session.user_id,
            expires_at: payload.session.expires_at,
        };
        if !session.is_active_at(Utc::now()) {
            tracing::debug!("session expired");
            return Ok(None);
        }
        Ok(Some(session))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    #[test]
    fn test_url_joins_base_without_double_slash() {
        let lookup = HttpSessionLookup::with_client(reqwest::Client::new(), "http://localhost:3000/");
        assert_eq!(lookup.url(), "http://localhost:3000/api/auth/get-session");
    }

    #[test]
    fn test_session_activity_window() {
        let now = Utc::now();
        let session = Session {
            session_id: "s1".into(),
            user_id: "u1".into(),
            expires_at: now + ChronoDuration::minutes(1),
        };
        assert!(session.is_active_at(now));
        assert!(!session.is_active_at(now + ChronoDuration::minutes(2)));
    }

    #[test]
    fn test_payload_parses_provider_shape() {
        let body = r#"{
            "session": { "id": "s1", "userId": "u1", "expiresAt": "2099-01-01T00:00:00.000Z", "token": "t" },
            "user": { "id": "u1", "email": "a@example.com" }
        }"#;
        let payload: Option<SessionPayload> = serde_json::from_str(body).expect("valid payload");
        let payload = payload.expect("session present");
        assert_eq!(payload.session.user_id, "u1");
        assert_eq!(payload.user.id, "u1");
    }

    #[test]
    fn test_null_payload_is_no_session() {
        let payload: Option<SessionPayload> = serde_json::from_str("null").expect("null is valid");
        assert!(payload.is_none());
    }

    #[tokio::test]
    async fn test_no_cookie_short_circuits() {
        // Unroutable URL: any request attempt would fail with a transport error.
        let lookup = HttpSessionLookup::with_client(reqwest::Client::new(), "http://127.0.0.1:1");
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().expect("header"));

        let result = lookup.get_session(&headers).await.expect("no request made");
        assert!(result.is_none());
    }
}

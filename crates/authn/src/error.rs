//! Authentication error types.
//!
//! Errors are layered: [`VerificationError`] carries the precise reason a
//! bearer token was rejected, [`KeyFetchError`] describes a failed key-set
//! retrieval, and [`SessionLookupError`] a failed session collaborator call.
//! At the [`IdentityResolver`](crate::IdentityResolver) boundary all of them
//! collapse into the single coarse [`AuthFailure::Unauthenticated`].

use std::sync::Arc;

use thiserror::Error;

/// A shareable boxed error used to keep source chains on cloneable errors.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Reasons a bearer token failed verification.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; new variants may be added in
/// future minor releases without a semver-breaking change.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerificationError {
    /// Token cannot be decoded as a JWT.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// JWT header carries no `kid`.
    #[error("Token header missing 'kid'")]
    MissingKeyId,

    /// Algorithm is forbidden or not in the accepted list.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Key id is absent from the key set even after a refetch.
    #[error("Unknown signing key: {kid}")]
    UnknownKey {
        /// Key ID from the token header.
        kid: String,
    },

    /// Signature does not verify against the published key.
    #[error("Invalid signature")]
    BadSignature,

    /// `exp` is in the past.
    #[error("Token expired")]
    Expired,

    /// `nbf` is in the future.
    #[error("Token not yet valid")]
    NotYetValid,

    /// `iss` does not equal the expected issuer.
    #[error("Issuer mismatch")]
    IssuerMismatch,

    /// `aud` does not contain the expected audience.
    #[error("Audience mismatch")]
    AudienceMismatch,

    /// A required claim is missing.
    #[error("Missing claim: {0}")]
    MissingClaim(String),

    /// The key set could not be retrieved.
    #[error("Key set fetch failed: {0}")]
    KeyFetchFailed(#[source] KeyFetchError),
}

impl VerificationError {
    /// Creates a `Malformed` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Creates an `UnknownKey` error.
    #[must_use]
    pub fn unknown_key(kid: impl Into<String>) -> Self {
        Self::UnknownKey { kid: kid.into() }
    }

    /// Creates a `MissingClaim` error.
    #[must_use]
    pub fn missing_claim(claim: impl Into<String>) -> Self {
        Self::MissingClaim(claim.into())
    }

    /// Stable snake_case label used as the `kind` field in log events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingKeyId => "missing_kid",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::UnknownKey { .. } => "unknown_key",
            Self::BadSignature => "bad_signature",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::AudienceMismatch => "audience_mismatch",
            Self::MissingClaim(_) => "missing_claim",
            Self::KeyFetchFailed(_) => "key_fetch_failed",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for VerificationError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature => Self::BadSignature,
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidIssuer => Self::IssuerMismatch,
            ErrorKind::InvalidAudience => Self::AudienceMismatch,
            ErrorKind::MissingRequiredClaim(claim) => Self::MissingClaim(claim.clone()),
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                Self::UnsupportedAlgorithm("Algorithm does not match the signing key".into())
            },
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) => {
                Self::Malformed("Invalid JWT structure".into())
            },
            _ => Self::Malformed(format!("JWT error: {err}")),
        }
    }
}

impl From<KeyFetchError> for VerificationError {
    fn from(err: KeyFetchError) -> Self {
        Self::KeyFetchFailed(err)
    }
}

/// Failure to retrieve or decode the remote key set.
///
/// Cloneable so that every caller joined on a single in-flight fetch
/// receives the same outcome.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum KeyFetchError {
    /// Transport-level failure reaching the key-set endpoint.
    #[error("Key set request failed: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
        /// Underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Endpoint answered with a non-success status.
    #[error("Key set endpoint returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// Response body is not a valid key-set document.
    #[error("Invalid key set document: {0}")]
    InvalidDocument(String),

    /// The background fetch task was cancelled or panicked.
    #[error("Key set fetch task aborted: {0}")]
    Aborted(String),
}

impl KeyFetchError {
    /// Creates a `Transport` error with a source.
    #[must_use]
    pub fn transport(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates an `InvalidDocument` error.
    #[must_use]
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument(message.into())
    }
}

/// Failure of the external session-verification collaborator.
///
/// Never fatal: the resolver treats it as "no session".
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionLookupError {
    /// The session backend could not be reached.
    #[error("Session backend unreachable: {0}")]
    Transport(#[source] reqwest::Error),

    /// The session backend answered with an unexpected status.
    #[error("Session backend returned status {0}")]
    Status(u16),

    /// The session payload could not be parsed.
    #[error("Invalid session payload: {0}")]
    InvalidPayload(String),

    /// Any other backend failure.
    #[error("Session backend error: {0}")]
    Backend(String),
}

/// Coarse outcome returned to callers of the identity resolver.
///
/// Deliberately carries no detail: the specific reason is only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    /// No valid session and no verifiable bearer token.
    #[error("Unauthenticated")]
    Unauthenticated,
}

/// Result type alias for token verification.
pub type Result<T> = std::result::Result<T, VerificationError>;

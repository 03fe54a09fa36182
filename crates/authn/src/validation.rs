//! JWT header validation.
//!
//! Algorithm and key-id checks run before any key lookup, so a forged header
//! can never cause a key-set fetch.
//!
//! # Security
//!
//! - Only asymmetric algorithms are accepted (EdDSA, ECDSA, RSA and RSA-PSS)
//! - Symmetric algorithms and "none" are always rejected

use crate::error::VerificationError;

/// Algorithms that are never accepted.
///
/// - `none`: no signature at all
/// - `HS256`, `HS384`, `HS512`: symmetric, the verifier would need the secret
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Algorithms a published key set may sign with.
///
/// `EdDSA` is the auth provider's default. The rest are the asymmetric key
/// types a published JWK can carry; keep in step with the key set's
/// algorithm mapping.
pub const ACCEPTED_ALGORITHMS: &[&str] =
    &["EdDSA", "ES256", "ES384", "RS256", "RS384", "RS512", "PS256", "PS384", "PS512"];

/// Maximum accepted length of a `kid` header value.
pub const MAX_KID_LENGTH: usize = 256;

/// Validate a JWT algorithm name against [`FORBIDDEN_ALGORITHMS`] and
/// [`ACCEPTED_ALGORITHMS`].
///
/// # Errors
///
/// Returns [`VerificationError::UnsupportedAlgorithm`] if the algorithm is
/// forbidden or not in the accepted list.
///
/// # Examples
///
/// ```
/// use authgate_authn::validation::validate_algorithm;
///
/// assert!(validate_algorithm("EdDSA").is_ok());
/// assert!(validate_algorithm("HS256").is_err());
/// assert!(validate_algorithm("none").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<(), VerificationError> {
    if FORBIDDEN_ALGORITHMS.contains(&alg) {
        return Err(VerificationError::UnsupportedAlgorithm(format!(
            "Algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    if !ACCEPTED_ALGORITHMS.contains(&alg) {
        return Err(VerificationError::UnsupportedAlgorithm(format!(
            "Algorithm '{alg}' is not in accepted list"
        )));
    }

    Ok(())
}

/// Validate the shape of a `kid` header value.
///
/// Rejects empty, oversized, or control-character key ids before they are
/// used as cache lookups or written to logs.
///
/// # Errors
///
/// Returns [`VerificationError::Malformed`] on an invalid key id.
pub fn validate_kid(kid: &str) -> Result<(), VerificationError> {
    if kid.is_empty() {
        return Err(VerificationError::malformed("kid is empty"));
    }
    if kid.len() > MAX_KID_LENGTH {
        return Err(VerificationError::malformed(format!(
            "kid exceeds {MAX_KID_LENGTH} bytes"
        )));
    }
    if kid.chars().any(char::is_control) {
        return Err(VerificationError::malformed("kid contains control characters"));
    }
    Ok(())
}

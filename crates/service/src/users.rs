//! Current-user lookup.

use authgate_authn::{Identity, IdentityResolver, Provenance};
use authgate_storage::{UserRecord, UserStore};
use http::HeaderMap;

use crate::error::ApiError;

/// The caller and their stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentUser {
    /// How the caller was identified.
    pub identity: Identity,
    /// The caller's user record.
    pub user: UserRecord,
}

impl CurrentUser {
    /// How the caller was identified.
    #[must_use]
    pub fn provenance(&self) -> Provenance {
        self.identity.provenance()
    }
}

/// Resolve the caller of a request and load their record.
///
/// # Errors
///
/// - [`ApiError::Unauthenticated`] without a valid session or token
/// - [`ApiError::UserNotFound`] if the identity has no record
/// - A 500-class [`ApiError`] if the database cannot be reached
#[tracing::instrument(skip_all)]
pub async fn current_user(
    resolver: &IdentityResolver,
    store: &dyn UserStore,
    headers: &HeaderMap,
) -> Result<CurrentUser, ApiError> {
    let identity = resolver.resolve(headers).await?;

    let user = match store.find_user(identity.user_id()).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::info!(user_id = %identity.user_id(), "authenticated caller has no user record");
            return Err(ApiError::UserNotFound);
        },
        Err(e) => {
            tracing::error!(user_id = %identity.user_id(), error = %e, "user lookup failed");
            return Err(e.into());
        },
    };

    Ok(CurrentUser { identity, user })
}

//! Read access to the auth provider's user table.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, pool::ConnectionPoolManager, postgres::PgConnector};

/// A user as stored by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// User id; the session `userId` and token `sub`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// Role assigned by the admin plugin, if any.
    pub role: Option<String>,
}

/// Lookup of user records.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Find a user by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the pool or query fails.
    async fn find_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError>;
}

const FIND_USER_SQL: &str = r#"SELECT id, name, email, role FROM "user" WHERE id = $1"#;

/// [`UserStore`] reading through the shared connection pool.
#[derive(Debug, Clone)]
pub struct PgUserStore {
    pool: Arc<ConnectionPoolManager<PgConnector>>,
    acquire_timeout: Duration,
}

impl PgUserStore {
    /// Creates a store that waits at most `acquire_timeout` for a connection.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPoolManager<PgConnector>>, acquire_timeout: Duration) -> Self {
        Self { pool, acquire_timeout }
    }
}

fn column<'a, T: tokio_postgres::types::FromSql<'a>>(
    row: &'a tokio_postgres::Row,
    name: &str,
) -> Result<T, StoreError> {
    row.try_get(name).map_err(|e| StoreError::query(format!("read column {name}"), e))
}

#[async_trait]
impl UserStore for PgUserStore {
    #[tracing::instrument(skip(self))]
    async fn find_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        let client = self.pool.acquire(self.acquire_timeout).await?;
        let row = client
            .query_opt(FIND_USER_SQL, &[&id])
            .await
            .map_err(|e| StoreError::query("select user", e))?;

        row.map(|row| {
            Ok(UserRecord {
                id: column(&row, "id")?,
                name: column(&row, "name")?,
                email: column(&row, "email")?,
                role: column(&row, "role")?,
            })
        })
        .transpose()
    }
}

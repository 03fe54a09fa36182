//! PostgreSQL [`Connector`] over `tokio-postgres`.

use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::{Client, config::SslMode};

use crate::{credential::Credential, error::ConnectError, pool::Connector};

/// Default PostgreSQL port.
pub const DEFAULT_PORT: u16 = 5432;

/// Opens `tokio-postgres` connections to a fixed target.
///
/// The target carries host, port, database and TLS mode; user and password
/// come from the [`Credential`] of each attempt.
#[derive(Clone)]
pub struct PgConnector {
    target: tokio_postgres::Config,
    tls: MakeTlsConnector,
}

impl std::fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnector")
            .field("host", &self.target.get_hosts())
            .field("dbname", &self.target.get_dbname())
            .finish_non_exhaustive()
    }
}

impl PgConnector {
    /// Connects to `target`, negotiating TLS per its `sslmode`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Tls`] if the TLS connector cannot be built.
    pub fn new(target: tokio_postgres::Config, accept_invalid_certs: bool) -> Result<Self, ConnectError> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| ConnectError::Tls(e.to_string()))?;
        Ok(Self { target, tls: MakeTlsConnector::new(tls) })
    }

    /// Target for the managed database service: TLS required, server
    /// certificate not verified.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Tls`] if the TLS connector cannot be built.
    pub fn managed(host: &str, port: u16, database: &str) -> Result<Self, ConnectError> {
        let mut target = tokio_postgres::Config::new();
        target.host(host).port(port).dbname(database).ssl_mode(SslMode::Require);
        Self::new(target, true)
    }

    /// Connection target.
    #[must_use]
    pub fn target(&self) -> &tokio_postgres::Config {
        &self.target
    }
}

fn classify(err: tokio_postgres::Error) -> ConnectError {
    match err.as_db_error() {
        // The server answered: bad password, unknown role or database.
        Some(db) => ConnectError::Rejected(format!("{} ({})", db.message(), db.code().code())),
        None => ConnectError::unreachable("connect to database", err),
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = Client;

    #[tracing::instrument(skip(self, credential), fields(user = %credential.principal()))]
    async fn connect(&self, credential: &Credential) -> Result<Client, ConnectError> {
        let mut config = self.target.clone();
        config.user(credential.principal());
        // An empty secret means password-less auth (trust, peer, certificate).
        if !credential.secret().is_empty() {
            config.password(credential.secret());
        }

        let (client, connection) = config.connect(self.tls.clone()).await.map_err(classify)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "database connection closed with error");
            }
        });
        Ok(client)
    }

    async fn is_healthy(&self, client: &mut Client) -> bool {
        !client.is_closed() && client.simple_query("").await.is_ok()
    }
}

//! Pool and managed credentials working together.

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use authgate_storage::{
    ConnectionPoolManager, CredentialProvider, ManagedCredentialConfig, ManagedCredentialProvider,
    PoolConfig, PoolError, PoolState, RetryConfig, TokenIssuer,
    testutil::{FakeConnector, MockTokenIssuer},
};
use tokio::task::JoinSet;

const CONCURRENCY: usize = 16;

fn managed(issuer: &Arc<MockTokenIssuer>) -> Arc<ManagedCredentialProvider> {
    let config = ManagedCredentialConfig::builder().principal("client-123").build();
    Arc::new(ManagedCredentialProvider::new(Arc::clone(issuer) as Arc<dyn TokenIssuer>, config))
}

fn pool(
    provider: &Arc<ManagedCredentialProvider>,
    max_size: usize,
) -> Arc<ConnectionPoolManager<FakeConnector>> {
    let config = PoolConfig::builder()
        .max_size(max_size)
        .acquire_timeout(Duration::from_secs(2))
        .connect_retry(RetryConfig::no_retry())
        .build();
    Arc::new(ConnectionPoolManager::new(
        FakeConnector::new(),
        Arc::clone(provider) as Arc<dyn CredentialProvider>,
        config,
    ))
}

#[tokio::test]
async fn connections_opened_after_refresh_use_new_token() {
    let issuer = Arc::new(MockTokenIssuer::new(Duration::from_secs(3600)));
    let provider = managed(&issuer);
    let pool = pool(&provider, 2);

    let first = pool.acquire_default().await.expect("first connection");
    assert_eq!(first.principal, "client-123");
    assert_eq!(first.secret, "token-1");

    provider.invalidate();
    let second = pool.acquire_default().await.expect("second connection");
    assert_eq!(second.secret, "token-2");

    // The open connection keeps the token it authenticated with.
    assert_eq!(first.secret, "token-1");
    assert_eq!(issuer.calls(), 2);
}

#[tokio::test]
async fn concurrent_first_use_builds_one_pool_and_one_token() {
    let issuer =
        Arc::new(MockTokenIssuer::new(Duration::from_secs(3600)).with_delay(Duration::from_millis(20)));
    let provider = managed(&issuer);
    let pool = pool(&provider, CONCURRENCY);

    let mut tasks = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let pool = Arc::clone(&pool);
        tasks.spawn(async move {
            let connection = pool.acquire_default().await.expect("connection");
            connection.secret.clone()
        });
    }

    while let Some(secret) = tasks.join_next().await {
        assert_eq!(secret.expect("task"), "token-1");
    }
    assert_eq!(pool.constructions(), 1);
    assert_eq!(pool.state(), PoolState::Ready);
    assert_eq!(issuer.calls(), 1);
    assert_eq!(provider.refresh_count(), 1);
}

#[tokio::test]
async fn issuer_outage_surfaces_as_connect_error_then_recovers() {
    let issuer = Arc::new(MockTokenIssuer::new(Duration::from_secs(3600)));
    issuer.fail_with(authgate_storage::CredentialFetchError::Status { status: 503 });
    let provider = managed(&issuer);
    let pool = pool(&provider, 2);

    let err = pool.acquire_default().await.expect_err("issuer down");
    assert!(matches!(err, PoolError::Connect(_)), "got {err:?}");

    // Managed pools are built without a credential, so the failure above
    // did not poison construction.
    assert_eq!(pool.state(), PoolState::Ready);

    issuer.recover();
    let connection = pool.acquire_default().await.expect("issuer back");
    assert_eq!(connection.principal, "client-123");
}

#[tokio::test]
async fn shutdown_rejects_later_callers() {
    let issuer = Arc::new(MockTokenIssuer::new(Duration::from_secs(3600)));
    let provider = managed(&issuer);
    let pool = pool(&provider, 2);

    drop(pool.acquire_default().await.expect("connection"));
    pool.shutdown();

    let err = pool.acquire_default().await.expect_err("closed");
    assert!(matches!(err, PoolError::Closed));
    assert_eq!(pool.status().state, PoolState::Closed);
}

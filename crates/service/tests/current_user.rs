//! Current-user lookup across identity resolution and the user store.

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use authgate::{ApiError, AppConfig, AppContext, EnvSettings, Environment, current_user};
use authgate_authn::{
    IdentityResolver, KeySetCache, KeySetFetcher, Provenance, SessionLookup, TokenVerifier,
    testutil::{MockKeySetFetcher, MockSessionLookup, TestKeyPair, jwk_set, standard_claims},
};
use authgate_storage::{
    UserStore,
    testutil::{MemoryUserStore, user},
};
use http::{HeaderMap, header};

const BASE_URL: &str = "http://localhost:3000";

fn resolver(sessions: MockSessionLookup, key: &TestKeyPair) -> IdentityResolver {
    let fetcher: Arc<dyn KeySetFetcher> = Arc::new(MockKeySetFetcher::new(jwk_set(&[key])));
    let cache = Arc::new(KeySetCache::new(fetcher, Duration::from_secs(300)));
    IdentityResolver::new(
        Arc::new(sessions) as Arc<dyn SessionLookup>,
        TokenVerifier::new(cache),
        BASE_URL,
    )
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, format!("Bearer {token}").parse().expect("header"));
    headers
}

fn store_with(ids: &[&str]) -> MemoryUserStore {
    let store = MemoryUserStore::new();
    for id in ids {
        store.insert(user(id));
    }
    store
}

#[tokio::test]
async fn session_caller_gets_their_record() {
    let key = TestKeyPair::generate("k1");
    let resolver = resolver(MockSessionLookup::with_user("user-1"), &key);
    let store = store_with(&["user-1"]);

    let current = current_user(&resolver, &store, &HeaderMap::new()).await.expect("found");

    assert_eq!(current.provenance(), Provenance::Session);
    assert_eq!(current.user.email, "user-1@example.com");
    assert!(current.identity.claims().is_none());
}

#[tokio::test]
async fn token_caller_gets_their_record() {
    let key = TestKeyPair::generate("k1");
    let resolver = resolver(MockSessionLookup::none(), &key);
    let store = store_with(&["user-2"]);
    let token = key.sign(&standard_claims(BASE_URL, BASE_URL, "user-2", 3600));

    let current = current_user(&resolver, &store, &bearer(&token)).await.expect("found");

    assert_eq!(current.provenance(), Provenance::Token);
    assert_eq!(current.user.id, "user-2");
    assert!(current.identity.claims().is_some());
}

#[tokio::test]
async fn unknown_user_is_not_found() {
    let key = TestKeyPair::generate("k1");
    let resolver = resolver(MockSessionLookup::with_user("ghost"), &key);
    let store = store_with(&["user-1"]);

    let err = current_user(&resolver, &store, &HeaderMap::new()).await.expect_err("no record");

    assert!(matches!(err, ApiError::UserNotFound));
    assert_eq!(err.status().as_u16(), 404);
}

#[tokio::test]
async fn anonymous_caller_is_unauthenticated() {
    let key = TestKeyPair::generate("k1");
    let resolver = resolver(MockSessionLookup::none(), &key);
    let store = store_with(&["user-1"]);

    let err = current_user(&resolver, &store, &HeaderMap::new()).await.expect_err("anonymous");

    assert!(matches!(err, ApiError::Unauthenticated));
    assert_eq!(err.body(Environment::Production).status, 401);
}

#[tokio::test]
async fn store_failure_is_internal_and_hidden_in_production() {
    let key = TestKeyPair::generate("k1");
    let resolver = resolver(MockSessionLookup::with_user("user-1"), &key);
    let store = store_with(&["user-1"]);
    store.fail_with("relation \"user\" does not exist");

    let err = current_user(&resolver, &store, &HeaderMap::new()).await.expect_err("query fails");

    assert!(err.is_server_error());
    let body = err.body(Environment::Production);
    assert_eq!(body.message, "Internal server error");
    assert!(body.detail.is_none());
    let dev = err.body(Environment::Development);
    assert!(dev.detail.expect("detail outside production").contains("does not exist"));
}

#[tokio::test]
async fn context_serves_current_user_through_overrides() {
    let settings = EnvSettings::from_vars([("DATABASE_URL", "postgres://app:secret@db:5432/app")])
        .expect("readable");
    let key = TestKeyPair::generate("k1");
    let context = AppContext::from_config(AppConfig::from_settings(&settings).expect("valid"))
        .expect("wired")
        .with_resolver(resolver(MockSessionLookup::with_user("user-1"), &key))
        .with_user_store(Arc::new(store_with(&["user-1"])) as Arc<dyn UserStore>);

    let current = context.current_user(&HeaderMap::new()).await.expect("found");

    assert_eq!(current.user.name, "User user-1");
    assert_eq!(context.pool().constructions(), 0, "the pool is never touched");
}

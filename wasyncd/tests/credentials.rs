use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wasync_core::{LegacyToken, OAuthClient};
use wasyncd::credentials::CredentialManager;
use wasyncd::storage::{CredentialStore, MemoryCredentialStore};
use wasyncd::sync::retry::{Backoff, RetryPolicy};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn legacy() -> LegacyToken {
    LegacyToken {
        token: "old-token".into(),
        secret: "old-secret".into(),
    }
}

fn manager(server: &MockServer, store: Arc<MemoryCredentialStore>) -> CredentialManager {
    let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
    CredentialManager::new(
        Arc::new(client),
        store,
        RetryPolicy {
            max_retries: 1,
            timeout: Duration::from_secs(2),
            backoff: Backoff::None,
        },
    )
}

async fn mount_exchange(server: &MockServer, refresh_token: &str) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("oauth_token=old-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "refresh_token": refresh_token
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn migration_stores_credential_and_clears_legacy_once() {
    let server = MockServer::start().await;
    mount_exchange(&server, "migrated-refresh").await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=migrated-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-1",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    let store = Arc::new(MemoryCredentialStore::with_legacy_token(legacy()));
    let manager = manager(&server, store.clone());

    let credential = manager.migrate_legacy_token("legacy-client").await.unwrap();
    assert_eq!(credential.access_token, "access-1");
    assert_eq!(credential.refresh_token, "migrated-refresh");
    assert_eq!(store.load_credential().unwrap(), Some(credential));
    assert!(store.load_legacy_token().unwrap().is_none());
    assert_eq!(store.legacy_clears(), 1);

    assert!(manager.migrate_legacy_token("legacy-client").await.is_none());
    assert_eq!(store.legacy_clears(), 1);
}

#[tokio::test]
async fn failed_legacy_clear_is_not_reported_as_migrated() {
    let server = MockServer::start().await;
    mount_exchange(&server, "migrated-refresh").await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-1",
            "expires_in": 3600
        })))
        .expect(2)
        .mount(&server)
        .await;
    let store = Arc::new(MemoryCredentialStore::with_legacy_token(legacy()));
    store.set_legacy_clear_failing(true);
    let manager = manager(&server, store.clone());

    assert!(manager.migrate_legacy_token("legacy-client").await.is_none());
    assert_eq!(store.load_legacy_token().unwrap(), Some(legacy()));
    assert_eq!(store.legacy_clears(), 0);

    store.set_legacy_clear_failing(false);
    assert!(manager.migrate_legacy_token("legacy-client").await.is_some());
    assert!(store.load_legacy_token().unwrap().is_none());
    assert_eq!(store.legacy_clears(), 1);
    assert!(manager.migrate_legacy_token("legacy-client").await.is_none());
}

#[tokio::test]
async fn empty_exchange_leaves_legacy_token_untouched() {
    let server = MockServer::start().await;
    mount_exchange(&server, "").await;
    let store = Arc::new(MemoryCredentialStore::with_legacy_token(legacy()));
    let manager = manager(&server, store.clone());

    assert!(manager.migrate_legacy_token("legacy-client").await.is_none());
    assert_eq!(store.load_legacy_token().unwrap(), Some(legacy()));
    assert!(store.load_credential().unwrap().is_none());
    assert_eq!(store.legacy_clears(), 0);
}

#[tokio::test]
async fn failed_refresh_after_exchange_leaves_legacy_token_untouched() {
    let server = MockServer::start().await;
    mount_exchange(&server, "migrated-refresh").await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let store = Arc::new(MemoryCredentialStore::with_legacy_token(legacy()));
    let manager = manager(&server, store.clone());

    assert!(manager.migrate_legacy_token("legacy-client").await.is_none());
    assert_eq!(store.load_legacy_token().unwrap(), Some(legacy()));
    assert!(store.load_credential().unwrap().is_none());
}

#[tokio::test]
async fn unreachable_provider_leaves_legacy_token_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;
    let store = Arc::new(MemoryCredentialStore::with_legacy_token(legacy()));
    let manager = manager(&server, store.clone());

    assert!(manager.migrate_legacy_token("legacy-client").await.is_none());
    assert_eq!(store.load_legacy_token().unwrap(), Some(legacy()));
}

#[tokio::test]
async fn nothing_to_migrate_without_legacy_token() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryCredentialStore::new());
    let manager = manager(&server, store);
    assert!(manager.migrate_legacy_token("legacy-client").await.is_none());
}

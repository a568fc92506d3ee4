use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use wasync_core::{Credential, ErrorClass, LegacyToken, OAuthClient, OAuthError};

use crate::storage::{CredentialStore, StorageError};
use crate::sync::retry::{LastFailure, RetryError, RetryPolicy, with_retry};

const REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("identity provider rejected the credential: {0}")]
    AuthRejected(String),
    #[error("identity provider unreachable after {attempts} attempts: {message}")]
    TransientIo { attempts: u32, message: String },
    #[error("identity provider request failed: {0}")]
    Provider(String),
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("no credential is stored")]
    NoCredential,
    #[error("credential storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl CredentialError {
    pub fn is_auth_rejected(&self) -> bool {
        matches!(
            self,
            CredentialError::AuthRejected(_)
                | CredentialError::MissingRefreshToken
                | CredentialError::NoCredential
        )
    }
}

impl From<RetryError<OAuthError>> for CredentialError {
    fn from(err: RetryError<OAuthError>) -> Self {
        match err {
            RetryError::Fatal(err) if rejects_credential(&err) => {
                CredentialError::AuthRejected(err.to_string())
            }
            RetryError::Fatal(err) => CredentialError::Provider(err.to_string()),
            RetryError::Exhausted { attempts, last } => CredentialError::TransientIo {
                attempts,
                message: match last {
                    LastFailure::Error(err) => err.to_string(),
                    LastFailure::TimedOut(after) => format!("timed out after {after:?}"),
                },
            },
        }
    }
}

/// 401/403 and other 4xx answers from the token endpoint (`invalid_grant`,
/// `invalid_client`) mean the credential itself was refused.
fn rejects_credential(err: &OAuthError) -> bool {
    match err {
        OAuthError::Api { status, .. } => status.is_client_error(),
        other => other.classification() == ErrorClass::Auth,
    }
}

/// Token endpoint of the identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn client_id(&self) -> &str;

    /// Trades a legacy token for a refresh token. `None` when the provider
    /// answered without one.
    async fn exchange_legacy_token(
        &self,
        legacy: &LegacyToken,
        client_id: &str,
    ) -> Result<Option<String>, OAuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<Credential, OAuthError>;
}

#[async_trait]
impl IdentityProvider for OAuthClient {
    fn client_id(&self) -> &str {
        OAuthClient::client_id(self)
    }

    async fn exchange_legacy_token(
        &self,
        legacy: &LegacyToken,
        client_id: &str,
    ) -> Result<Option<String>, OAuthError> {
        OAuthClient::exchange_legacy_token(self, legacy, client_id).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential, OAuthError> {
        let token = self.refresh_token(refresh_token).await?;
        Ok(Credential::from_token(&token, refresh_token))
    }
}

/// Hands out live access tokens and serializes refreshes per account.
pub struct CredentialManager {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn CredentialStore>,
    policy: RetryPolicy,
    refresh_skew_secs: i64,
    refresh_lock: Mutex<()>,
}

impl CredentialManager {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn CredentialStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            store,
            policy,
            refresh_skew_secs: REFRESH_SKEW_SECS,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Current access token, refreshed first when it expires within the skew.
    pub async fn valid_access_token(&self) -> Result<String, CredentialError> {
        let current = self
            .store
            .load_credential()?
            .ok_or(CredentialError::NoCredential)?;
        if current.expires_within(self.refresh_skew_secs) {
            return Ok(self.refresh(&current).await?.access_token);
        }
        Ok(current.access_token)
    }

    /// Forces a refresh after the mailbox rejected the current token.
    pub async fn on_unauthorized(&self) -> Result<String, CredentialError> {
        let current = self
            .store
            .load_credential()?
            .ok_or(CredentialError::NoCredential)?;
        Ok(self.refresh(&current).await?.access_token)
    }

    /// Exchanges `current.refresh_token` for a new credential and persists it.
    ///
    /// Only one refresh runs at a time. A caller that waited on another
    /// refresh gets that result instead of spending the refresh token again.
    pub async fn refresh(&self, current: &Credential) -> Result<Credential, CredentialError> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(stored) = self.store.load_credential()?
            && stored.access_token != current.access_token
        {
            return Ok(stored);
        }
        if current.refresh_token.trim().is_empty() {
            return Err(CredentialError::MissingRefreshToken);
        }

        let refreshed = with_retry(&self.policy, "credential refresh", || {
            self.provider.refresh(&current.refresh_token)
        })
        .await
        .inspect_err(|err| warn!("credential refresh failed: {err}"))?;
        self.store.save_credential(&refreshed)?;
        info!(expires_at = ?refreshed.expires_at, "credential refreshed");
        Ok(refreshed)
    }

    /// One-shot upgrade of a legacy token to a refresh-token credential.
    ///
    /// Any failure leaves the legacy token in place and yields `None`. The
    /// legacy token is cleared only after the new credential is stored, and
    /// success is reported only once it is gone, so calling this again after
    /// success does nothing.
    pub async fn migrate_legacy_token(&self, client_id: &str) -> Option<Credential> {
        let legacy = match self.store.load_legacy_token() {
            Ok(Some(legacy)) => legacy,
            Ok(None) => return None,
            Err(err) => {
                warn!("could not read legacy token: {err}");
                return None;
            }
        };

        let exchanged = with_retry(&self.policy, "legacy token exchange", || {
            self.provider.exchange_legacy_token(&legacy, client_id)
        })
        .await;
        let refresh_token = match exchanged {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!("legacy token exchange returned no refresh token");
                return None;
            }
            Err(err) => {
                warn!("legacy token exchange failed: {err}");
                return None;
            }
        };

        let _guard = self.refresh_lock.lock().await;
        let credential = match with_retry(&self.policy, "credential refresh", || {
            self.provider.refresh(&refresh_token)
        })
        .await
        {
            Ok(credential) => credential,
            Err(err) => {
                warn!("refresh after legacy exchange failed: {err}");
                return None;
            }
        };
        if let Err(err) = self.store.save_credential(&credential) {
            warn!("could not store migrated credential: {err}");
            return None;
        }
        if let Err(err) = self.store.clear_legacy_token() {
            warn!("migrated credential stored but legacy token not cleared: {err}");
            return None;
        }
        info!("legacy token migrated");
        Some(credential)
    }

    /// Removes the stored credential.
    pub fn logout(&self) -> Result<(), CredentialError> {
        self.store.delete_credential()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCredentialStore;
    use crate::sync::retry::Backoff;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            timeout: Duration::from_millis(500),
            backoff: Backoff::None,
        }
    }

    fn credential(access: &str, expires_at: Option<i64>) -> Credential {
        Credential {
            access_token: access.into(),
            refresh_token: "refresh-1".into(),
            expires_at,
        }
    }

    fn manager(server: &MockServer, store: Arc<MemoryCredentialStore>, retries: u32) -> CredentialManager {
        let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
        CredentialManager::new(Arc::new(client), store, policy(retries))
    }

    fn token_response(access: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "access_token": access,
            "token_type": "Bearer",
            "expires_in": 3600
        }))
    }

    #[tokio::test]
    async fn returns_current_token_when_not_expired() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryCredentialStore::with_credential(credential(
            "token-1",
            Some(i64::MAX),
        )));
        let manager = manager(&server, store, 0);

        assert_eq!(manager.valid_access_token().await.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn refreshes_token_when_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(token_response("token-2"))
            .expect(1)
            .mount(&server)
            .await;
        let store = Arc::new(MemoryCredentialStore::with_credential(credential("token-1", Some(0))));
        let manager = manager(&server, store.clone(), 0);

        assert_eq!(manager.valid_access_token().await.unwrap(), "token-2");
        let stored = store.load_credential().unwrap().unwrap();
        assert_eq!(stored.access_token, "token-2");
        assert_eq!(stored.refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("token-2"))
            .mount(&server)
            .await;
        let store = Arc::new(MemoryCredentialStore::with_credential(credential("token-1", None)));
        let manager = manager(&server, store, 2);

        assert_eq!(manager.on_unauthorized().await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn exhausted_retries_are_transient_io() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        let store = Arc::new(MemoryCredentialStore::with_credential(credential("token-1", None)));
        let manager = manager(&server, store, 2);

        let err = manager.on_unauthorized().await.unwrap_err();
        assert!(matches!(err, CredentialError::TransientIo { attempts: 3, .. }));
        assert!(!err.is_auth_rejected());
    }

    #[tokio::test]
    async fn timeouts_are_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("late").set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        let store = Arc::new(MemoryCredentialStore::with_credential(credential("token-1", None)));
        let client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
        let manager = CredentialManager::new(
            Arc::new(client),
            store,
            RetryPolicy {
                max_retries: 1,
                timeout: Duration::from_millis(50),
                backoff: Backoff::None,
            },
        );

        let err = manager.on_unauthorized().await.unwrap_err();
        assert!(matches!(err, CredentialError::TransientIo { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn rejected_refresh_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let store = Arc::new(MemoryCredentialStore::with_credential(credential("token-1", Some(0))));
        let manager = manager(&server, store, 5);

        let err = manager.valid_access_token().await.unwrap_err();
        assert!(matches!(err, CredentialError::AuthRejected(_)));
        assert!(err.is_auth_rejected());
    }

    #[tokio::test]
    async fn unreadable_token_response_is_a_provider_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .expect(1)
            .mount(&server)
            .await;
        let store = Arc::new(MemoryCredentialStore::with_credential(credential("token-1", Some(0))));
        let manager = manager(&server, store, 3);

        let err = manager.valid_access_token().await.unwrap_err();
        assert!(matches!(err, CredentialError::Provider(_)), "{err:?}");
        assert!(!err.is_auth_rejected());
    }

    #[tokio::test]
    async fn unauthorized_client_is_auth_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_client"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let store = Arc::new(MemoryCredentialStore::with_credential(credential("token-1", None)));
        let manager = manager(&server, store, 3);

        let err = manager.on_unauthorized().await.unwrap_err();
        assert!(matches!(err, CredentialError::AuthRejected(_)));
    }

    #[tokio::test]
    async fn logout_removes_stored_credential() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryCredentialStore::with_credential(credential(
            "token-1",
            Some(i64::MAX),
        )));
        let manager = manager(&server, store.clone(), 0);

        manager.logout().unwrap();
        assert!(store.load_credential().unwrap().is_none());
        assert!(matches!(
            manager.valid_access_token().await.unwrap_err(),
            CredentialError::NoCredential
        ));
    }

    #[tokio::test]
    async fn missing_credential_is_reported() {
        let server = MockServer::start().await;
        let manager = manager(&server, Arc::new(MemoryCredentialStore::new()), 0);
        assert!(matches!(
            manager.valid_access_token().await.unwrap_err(),
            CredentialError::NoCredential
        ));
    }

    #[tokio::test]
    async fn empty_refresh_token_is_reported() {
        let server = MockServer::start().await;
        let mut stale = credential("token-1", Some(0));
        stale.refresh_token.clear();
        let manager = manager(&server, Arc::new(MemoryCredentialStore::with_credential(stale)), 0);
        assert!(matches!(
            manager.valid_access_token().await.unwrap_err(),
            CredentialError::MissingRefreshToken
        ));
    }

    #[tokio::test]
    async fn refresh_reuses_credential_refreshed_by_another_caller() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("token-2"))
            .expect(1)
            .mount(&server)
            .await;
        let stale = credential("token-1", Some(0));
        let store = Arc::new(MemoryCredentialStore::with_credential(stale.clone()));
        let manager = manager(&server, store, 0);

        let first = manager.refresh(&stale).await.unwrap();
        let second = manager.refresh(&stale).await.unwrap();
        assert_eq!(first, second);
    }
}

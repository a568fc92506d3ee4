use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://oauth2.googleapis.com";
const LEGACY_MIGRATION_GRANT: &str = "urn:ietf:params:oauth:grant-type:migration:oauth1";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl OAuthError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            OAuthError::Api { status, .. } => classify_status(*status),
            OAuthError::Request(err)
                if err.is_timeout() || err.is_connect() || err.is_request() =>
            {
                ErrorClass::Transient
            }
            OAuthError::Request(err) => match err.status() {
                Some(status) => classify_status(status),
                None => ErrorClass::Permanent,
            },
            OAuthError::Url(_) => ErrorClass::Permanent,
        }
    }

    /// Whether retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ErrorClass::RateLimit | ErrorClass::Transient
        )
    }
}

fn classify_status(status: StatusCode) -> ErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Client for the identity provider's token endpoint.
#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

impl OAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Self::with_base_url(DEFAULT_BASE_URL, client_id, client_secret)
    }

    pub fn with_base_url(
        base_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, OAuthError> {
        let url = self.base_url.join("/token")?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self.http.post(url).form(&form).send().await?;
        if response.status().is_success() {
            Ok(response.json::<OAuthToken>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(OAuthError::Api { status, body })
        }
    }

    /// Trades a legacy token/secret pair for a refresh token.
    ///
    /// Returns `Ok(None)` when the provider answers without a refresh token.
    pub async fn exchange_legacy_token(
        &self,
        legacy: &LegacyToken,
        client_id: &str,
    ) -> Result<Option<String>, OAuthError> {
        let url = self.base_url.join("/token")?;
        let form = [
            ("grant_type", LEGACY_MIGRATION_GRANT),
            ("client_id", client_id),
            ("client_secret", self.client_secret.as_str()),
            ("oauth_token", legacy.token.as_str()),
            ("oauth_token_secret", legacy.secret.as_str()),
        ];

        let response = self.http.post(url).form(&form).send().await?;
        if response.status().is_success() {
            let body = response.json::<MigrationResponse>().await?;
            Ok(body.refresh_token.filter(|token| !token.trim().is_empty()))
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(OAuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MigrationResponse {
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Token pair from the older single-token scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyToken {
    pub token: String,
    pub secret: String,
}

/// Access/refresh token pair. Superseded as a whole on every refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds; `None` when the provider gave no lifetime.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl Credential {
    /// Builds a credential from a token response, keeping `previous_refresh`
    /// when the provider does not rotate the refresh token.
    pub fn from_token(token: &OAuthToken, previous_refresh: &str) -> Self {
        let refresh_token = token
            .refresh_token
            .clone()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| previous_refresh.to_string());
        Self {
            access_token: token.access_token.clone(),
            refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| now_unix().saturating_add(secs as i64)),
        }
    }

    /// Whether the token expires within `skew_secs` from now.
    pub fn expires_within(&self, skew_secs: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= now_unix().saturating_add(skew_secs))
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

//! Bearer-token acquisition for the push gateway.
//!
//! The gateway authenticates sends with short-lived bearer tokens
//! obtained through the JWT-bearer grant: sign an assertion with the
//! service-account key, post it to the token endpoint, cache the token
//! that comes back. The cache is renewed single-flight, so a burst of
//! dispatches hitting an expired token triggers exactly one exchange.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::ServiceAccount;
use crate::constants::{
    ASSERTION_LIFETIME_SECS, CLOCK_SKEW_ALLOWANCE_SECS, TOKEN_EXCHANGE_TIMEOUT,
    TOKEN_EXPIRY_MARGIN,
};

/// OAuth scope requested for messaging sends.
pub const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Errors raised while acquiring a bearer token.
#[derive(Debug)]
pub enum CredentialError {
    /// The service-account private key could not be parsed or used.
    Key(String),
    /// The exchange request never produced an HTTP response.
    Exchange(String),
    /// The token endpoint refused the assertion.
    Rejected { status: u16, message: String },
    /// The token endpoint answered with an unusable body.
    MalformedResponse(String),
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(msg) => write!(f, "Credential key error: {msg}"),
            Self::Exchange(msg) => write!(f, "Token exchange failed: {msg}"),
            Self::Rejected { status, message } => {
                write!(f, "Token endpoint rejected exchange ({status}): {message}")
            }
            Self::MalformedResponse(msg) => write!(f, "Malformed token response: {msg}"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// A bearer token plus the moment it stops being trustworthy.
#[derive(Debug, Clone)]
pub struct BearerToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl BearerToken {
    #[must_use]
    pub fn new(value: String, expires_at: DateTime<Utc>) -> Self {
        Self { value, expires_at }
    }

    /// The raw token for the Authorization header.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether the token is still usable.
    ///
    /// A token inside the expiry margin counts as stale so a send never
    /// goes out with a token about to lapse mid-flight.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        Utc::now() < self.expires_at - TOKEN_EXPIRY_MARGIN
    }
}

/// Assertion claims presented to the token endpoint.
#[derive(Serialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct ExchangeResponse {
    access_token: String,
    expires_in: i64,
}

/// Swaps a service-account identity for a bearer token.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, account: &ServiceAccount) -> Result<BearerToken, CredentialError>;
}

/// Production exchanger implementing the JWT-bearer grant over HTTP.
pub struct JwtGrantExchanger {
    client: reqwest::Client,
}

impl JwtGrantExchanger {
    /// Builds the production exchanger with the exchange timeout applied.
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(TOKEN_EXCHANGE_TIMEOUT)
            .build()
            .context("Failed to build token exchange HTTP client")?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds and signs the RS256 assertion.
    ///
    /// `iat` is backdated by the skew allowance; token endpoints reject
    /// assertions that appear to come from the future.
    fn signed_assertion(account: &ServiceAccount) -> Result<String, CredentialError> {
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| CredentialError::Key(format!("Invalid service account key: {e}")))?;
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: account.client_email.clone(),
            scope: MESSAGING_SCOPE.to_string(),
            aud: account.token_uri.clone(),
            iat: now - CLOCK_SKEW_ALLOWANCE_SECS,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| CredentialError::Key(format!("Failed to sign assertion: {e}")))
    }
}

#[async_trait]
impl TokenExchange for JwtGrantExchanger {
    async fn exchange(&self, account: &ServiceAccount) -> Result<BearerToken, CredentialError> {
        let assertion = Self::signed_assertion(account)?;

        let response = self
            .client
            .post(&account.token_uri)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CredentialError::Exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::MalformedResponse(e.to_string()))?;
        Ok(BearerToken::new(
            body.access_token,
            Utc::now() + chrono::Duration::seconds(body.expires_in),
        ))
    }
}

/// Caches bearer tokens and renews them single-flight.
pub struct CredentialProvider {
    account: ServiceAccount,
    exchanger: Arc<dyn TokenExchange>,
    cached: Mutex<Option<BearerToken>>,
}

impl CredentialProvider {
    #[must_use]
    pub fn new(account: ServiceAccount, exchanger: Arc<dyn TokenExchange>) -> Self {
        Self {
            account,
            exchanger,
            cached: Mutex::new(None),
        }
    }

    /// Returns a token usable for at least the expiry margin.
    ///
    /// The cache lock is held across the exchange, so concurrent callers
    /// that miss the cache wait for one renewal instead of each issuing
    /// their own.
    pub async fn bearer_token(&self) -> Result<BearerToken, CredentialError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.clone());
        }

        log::debug!("[Credentials] Exchanging service account assertion for bearer token");
        let token = self.exchanger.exchange(&self.account).await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drops the cached token so the next caller performs an exchange.
    ///
    /// Invoked when the gateway reports a send as unauthorized, which
    /// means the token died before its advertised expiry.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        if cached.take().is_some() {
            log::info!("[Credentials] Cached bearer token invalidated");
        }
    }
}

//! Remote account provisioning client.
//!
//! The reconciler drives the provisioning service through the
//! [`ProvisioningApi`] trait. The raw operations mirror the service's HTTP
//! surface; the provided [`ensure_account`](ProvisioningApi::ensure_account)
//! and [`activate_until`](ProvisioningApi::activate_until) combinators are
//! the idempotent forms every engine path uses.
//!
//! Authorization is a bearer token obtained from the service's own token
//! endpoint, held in an explicit [`TokenCache`] and refreshed only when
//! absent or past its expiry. A token fetch failure is fatal to the calling
//! operation; the caller's retry policy governs any further attempts.

use std::{sync::LazyLock, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::instrument;
use url::Url;

use crate::{
    config::ProvisioningConfig,
    error::{EngineError, Result},
};

/// Timeout for provisioning requests in seconds.
const PROVISIONING_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared HTTP client for all provisioning requests.
static PROVISIONING_HTTP_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(PROVISIONING_REQUEST_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(100)
        .build()
        .expect("failed to create provisioning HTTP client")
});

/// Remote account state as reported by the provisioning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAccount {
    /// Recorded expiry, absent for accounts without one.
    pub expires_at: Option<DateTime<Utc>>,
    /// URL granting the subscriber access.
    pub access_url: String,
}

/// Provisioning operations consumed by the reconciler.
///
/// Implementors supply the five raw operations; the provided combinators
/// encode the engine's two renewal semantics on top of them.
pub trait ProvisioningApi: Send + Sync {
    /// Reads the remote account, `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns error on transport or authorization failure.
    async fn fetch(&self, handle: &str) -> Result<Option<RemoteAccount>>;

    /// Creates the remote account with the given expiry, returning its
    /// access URL.
    ///
    /// # Errors
    ///
    /// Returns error on transport or authorization failure, or when the
    /// service rejects the creation.
    async fn create(&self, handle: &str, expires_at: DateTime<Utc>) -> Result<String>;

    /// Moves the remote account's expiry to an absolute instant, returning
    /// its access URL.
    ///
    /// # Errors
    ///
    /// Returns error on transport or authorization failure, or when the
    /// account does not exist.
    async fn extend(&self, handle: &str, new_expires_at: DateTime<Utc>) -> Result<String>;

    /// Marks the remote account inactive without deleting it.
    ///
    /// # Errors
    ///
    /// Returns error on transport or authorization failure, or when the
    /// account does not exist.
    async fn pause(&self, handle: &str) -> Result<()>;

    /// Removes the remote account entirely. Deleting an absent account is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns error on transport or authorization failure.
    async fn delete(&self, handle: &str) -> Result<()>;

    /// Creates the account if absent, else extends its expiry by
    /// `extend_by` from its current recorded expiry (not from `now`).
    ///
    /// This is the manual/administrative renewal semantics: time already
    /// paid for is never discarded.
    ///
    /// # Errors
    ///
    /// Propagates the underlying operation's error.
    async fn ensure_account(
        &self,
        handle: &str,
        extend_by: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        match self.fetch(handle).await? {
            Some(account) => {
                let base = account.expires_at.unwrap_or(now);
                self.extend(handle, base + extend_by).await
            }
            None => self.create(handle, now + extend_by).await,
        }
    }

    /// Creates or extends the account to an absolute expiry.
    ///
    /// This is the activation and auto-renewal semantics: the paid period
    /// starts now, regardless of what the remote side recorded before.
    ///
    /// # Errors
    ///
    /// Propagates the underlying operation's error.
    async fn activate_until(&self, handle: &str, expires_at: DateTime<Utc>) -> Result<String> {
        if self.fetch(handle).await?.is_some() {
            self.extend(handle, expires_at).await
        } else {
            self.create(handle, expires_at).await
        }
    }
}

// ============================================================================
// Token cache
// ============================================================================

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Cached bearer token with expiry, owned by the provisioning client.
///
/// Refreshes are serialized: concurrent callers that find the slot stale
/// wait for one refresh rather than issuing several.
#[derive(Debug, Default)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached token, or runs `refresh` when the slot is empty
    /// or past its expiry.
    ///
    /// `refresh` yields the new token and its time-to-live.
    ///
    /// # Errors
    ///
    /// Propagates the refresh failure; the stale slot is left untouched so
    /// a later call retries the fetch.
    pub async fn get_or_refresh<F, Fut>(&self, now: DateTime<Utc>, refresh: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, chrono::Duration)>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref()
            && cached.expires_at > now
        {
            return Ok(cached.token.clone());
        }
        let (token, ttl) = refresh().await?;
        *slot = Some(CachedToken { token: token.clone(), expires_at: now + ttl });
        Ok(token)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    expire: Option<i64>,
    #[serde(default)]
    data_limit: Option<u64>,
    #[serde(default)]
    proxies: serde_json::Value,
    #[serde(default)]
    subscription_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateAccountRequest<'a> {
    username: &'a str,
    expire: i64,
    data_limit: u64,
    proxies: serde_json::Value,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct UpdateAccountRequest {
    expire: Option<i64>,
    data_limit: u64,
    proxies: serde_json::Value,
    status: &'static str,
}

fn default_proxies() -> serde_json::Value {
    serde_json::json!({ "vless": {}, "vmess": {} })
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Provisioning client over HTTP with cached bearer authorization.
#[derive(Debug)]
pub struct HttpProvisioningClient {
    client: Client,
    base_url: Url,
    username: String,
    password: String,
    token_ttl: chrono::Duration,
    token: TokenCache,
}

impl HttpProvisioningClient {
    /// Builds a provisioning client from validated configuration, resolving
    /// credentials from the environment variables the config names.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the base URL does not parse or a
    /// named credential variable is unset.
    pub fn from_config(config: &ProvisioningConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| EngineError::Config(format!("invalid provisioning base_url: {e}")))?;
        let username = std::env::var(&config.username_env).map_err(|_| {
            EngineError::Config(format!("environment variable {} is not set", config.username_env))
        })?;
        let password = std::env::var(&config.password_env).map_err(|_| {
            EngineError::Config(format!("environment variable {} is not set", config.password_env))
        })?;
        Ok(Self {
            client: PROVISIONING_HTTP_CLIENT.clone(),
            base_url,
            username,
            password,
            token_ttl: chrono::Duration::seconds(i64::try_from(config.token_ttl_secs).unwrap_or(i64::MAX)),
            token: TokenCache::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| EngineError::Config(format!("invalid provisioning endpoint path: {e}")))
    }

    /// Fetches a fresh bearer token from the service's token endpoint.
    async fn authenticate(&self) -> Result<(String, chrono::Duration)> {
        let response = self
            .client
            .post(self.endpoint("admin/token")?)
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(|e| EngineError::Auth(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EngineError::Auth(format!(
                "token endpoint returned status {}",
                response.status().as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Auth(format!("malformed token response: {e}")))?;
        Ok((body.access_token, self.token_ttl))
    }

    async fn bearer(&self) -> Result<String> {
        self.token.get_or_refresh(Utc::now(), || self.authenticate()).await
    }

    /// Reads the raw account payload, preserving the fields an update must
    /// echo back.
    async fn fetch_raw(&self, handle: &str) -> Result<Option<AccountResponse>> {
        let token = self.bearer().await?;
        let response = self
            .client
            .get(self.endpoint(&format!("user/{handle}"))?)
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EngineError::Gateway(format!(
                "account read returned status {}",
                response.status().as_u16()
            )));
        }

        let body: AccountResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Gateway(format!("malformed account response: {e}")))?;
        Ok(Some(body))
    }

    fn access_url_for(&self, handle: &str, reported: Option<String>) -> String {
        reported.unwrap_or_else(|| format!("{}sub/{handle}", self.base_url))
    }

    async fn put_account(&self, handle: &str, request: &UpdateAccountRequest) -> Result<AccountResponse> {
        let token = self.bearer().await?;
        let response = self
            .client
            .put(self.endpoint(&format!("user/{handle}"))?)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Gateway(format!(
                "account update returned status {}",
                response.status().as_u16()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::Gateway(format!("malformed account response: {e}")))
    }
}

fn to_unix(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

impl ProvisioningApi for HttpProvisioningClient {
    #[instrument(skip(self))]
    async fn fetch(&self, handle: &str) -> Result<Option<RemoteAccount>> {
        let Some(raw) = self.fetch_raw(handle).await? else {
            return Ok(None);
        };
        Ok(Some(RemoteAccount {
            expires_at: raw.expire.and_then(from_unix),
            access_url: self.access_url_for(handle, raw.subscription_url),
        }))
    }

    #[instrument(skip(self))]
    async fn create(&self, handle: &str, expires_at: DateTime<Utc>) -> Result<String> {
        let token = self.bearer().await?;
        let request = CreateAccountRequest {
            username: handle,
            expire: to_unix(expires_at),
            data_limit: 0,
            proxies: default_proxies(),
            status: "active",
        };

        let response = self
            .client
            .post(self.endpoint("user")?)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Gateway(format!(
                "account creation returned status {}",
                response.status().as_u16()
            )));
        }

        let body: AccountResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Gateway(format!("malformed account response: {e}")))?;
        Ok(self.access_url_for(handle, body.subscription_url))
    }

    #[instrument(skip(self))]
    async fn extend(&self, handle: &str, new_expires_at: DateTime<Utc>) -> Result<String> {
        let Some(raw) = self.fetch_raw(handle).await? else {
            return Err(EngineError::Gateway(format!("account {handle} not found for extension")));
        };
        let request = UpdateAccountRequest {
            expire: Some(to_unix(new_expires_at)),
            data_limit: raw.data_limit.unwrap_or(0),
            proxies: raw.proxies,
            status: "active",
        };
        let body = self.put_account(handle, &request).await?;
        Ok(self.access_url_for(handle, body.subscription_url))
    }

    #[instrument(skip(self))]
    async fn pause(&self, handle: &str) -> Result<()> {
        let Some(raw) = self.fetch_raw(handle).await? else {
            return Err(EngineError::Gateway(format!("account {handle} not found for pause")));
        };
        let request = UpdateAccountRequest {
            expire: raw.expire,
            data_limit: raw.data_limit.unwrap_or(0),
            proxies: raw.proxies,
            status: "disabled",
        };
        self.put_account(handle, &request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, handle: &str) -> Result<()> {
        let token = self.bearer().await?;
        let response = self
            .client
            .delete(self.endpoint(&format!("user/{handle}"))?)
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(EngineError::Gateway(format!(
            "account deletion returned status {}",
            response.status().as_u16()
        )))
    }
}

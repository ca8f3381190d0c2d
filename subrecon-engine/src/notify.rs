//! User-facing notification delivery.
//!
//! Notifications are fire-and-forget side effects of state transitions: the
//! reconciler reports them through a best-effort wrapper that logs failures
//! and never lets delivery block or fail the transition itself.

use std::{sync::LazyLock, time::Duration};

use reqwest::Client;
use serde::Serialize;
use url::Url;

use crate::{
    config::NotifierConfig,
    error::{EngineError, Result},
    store::models::SubscriberId,
};

/// Timeout for notification requests in seconds.
const NOTIFY_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Shared HTTP client for all notification requests.
static NOTIFY_HTTP_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(NOTIFY_REQUEST_TIMEOUT_SECS))
        .build()
        .expect("failed to create notifier HTTP client")
});

/// Message delivery to a subscriber.
pub trait Notifier: Send + Sync {
    /// Delivers `text` to the subscriber.
    ///
    /// # Errors
    ///
    /// Returns error on delivery failure; callers treat this as best-effort
    /// and must not propagate it into the transition being reported.
    async fn send(&self, to: &SubscriberId, text: &str) -> Result<()>;
}

/// Notifier that drops every message.
///
/// Used when no notification endpoint is configured; the engine's
/// transitions proceed exactly as with a real notifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    async fn send(&self, _to: &SubscriberId, _text: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Notifier posting to a bot-style send-message endpoint.
#[derive(Debug)]
pub struct HttpNotifier {
    client: Client,
    endpoint: Url,
}

impl HttpNotifier {
    /// Builds a notifier from configuration, resolving the bot token from
    /// the environment variable the config names.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the base URL does not parse or
    /// the token variable is unset.
    pub fn from_config(config: &NotifierConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            EngineError::Config(format!("environment variable {} is not set", config.token_env))
        })?;
        let endpoint = Url::parse(&config.base_url)
            .and_then(|base| base.join(&format!("bot{token}/sendMessage")))
            .map_err(|e| EngineError::Config(format!("invalid notifier base_url: {e}")))?;
        Ok(Self { client: NOTIFY_HTTP_CLIENT.clone(), endpoint })
    }
}

impl Notifier for HttpNotifier {
    async fn send(&self, to: &SubscriberId, text: &str) -> Result<()> {
        let request = SendMessageRequest { chat_id: to.as_str(), text };
        let response = self.client.post(self.endpoint.clone()).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Gateway(format!(
                "notifier returned status {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_message_wire_shape() {
        let id = SubscriberId::new("u1").unwrap();
        let request = SendMessageRequest { chat_id: id.as_str(), text: "subscription renewed" };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["chat_id"], "u1");
        assert_eq!(json["text"], "subscription renewed");
    }

    #[test]
    fn test_from_config_missing_token() {
        let config = NotifierConfig {
            base_url: "https://api.telegram.org".to_owned(),
            token_env: "SUBRECON_TEST_UNSET_BOT_TOKEN".to_owned(),
        };
        let result = HttpNotifier::from_config(&config);
        assert!(matches!(result.unwrap_err(), EngineError::Config(_)));
    }
}

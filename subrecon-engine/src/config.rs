//! Engine configuration.
//!
//! TOML-deserializable configuration for the gateway clients and the
//! renewal policy. Secrets are never stored inline: the config names the
//! environment variables that hold them, and the clients resolve those at
//! construction time.

use rust_decimal::Decimal;
use serde::Deserialize;
use url::Url;

use crate::{
    error::{EngineError, Result},
    store::models::Term,
    tariff::TariffTable,
};

/// Root engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Payment gateway endpoint and credential references.
    pub payment: PaymentGatewayConfig,

    /// Provisioning service endpoint and credential references.
    pub provisioning: ProvisioningConfig,

    /// Notification endpoint; omit to run without user-facing messages.
    #[serde(default)]
    pub notifier: Option<NotifierConfig>,

    /// Renewal, retry, and purge policy.
    #[serde(default)]
    pub renewal: RenewalConfig,

    /// Tariff rows; defaults to the standard month/year pricing.
    #[serde(default = "default_tariffs")]
    pub tariffs: Vec<TariffEntry>,
}

impl EngineConfig {
    /// Parses configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] on syntax or shape errors.
    pub fn from_toml(document: &str) -> Result<Self> {
        toml::from_str(document).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Validates the configuration.
    ///
    /// Checks that:
    /// - the payment gateway URL is HTTPS with a host (payments always cross
    ///   the public internet)
    /// - the provisioning and notifier URLs parse and have a host (panels
    ///   are often reachable over plain HTTP on private networks)
    /// - every referenced environment variable name is well-formed
    /// - the renewal policy allows at least one charge attempt
    /// - no tariff row carries a negative price
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] describing the first failure.
    pub fn validate(&self) -> Result<()> {
        let payment_url = parse_base_url("payment.base_url", &self.payment.base_url)?;
        if payment_url.scheme() != "https" {
            return Err(EngineError::Config(format!(
                "payment.base_url must use HTTPS, got: {}",
                payment_url.scheme()
            )));
        }
        validate_env_var_name("payment.shop_id_env", &self.payment.shop_id_env)?;
        validate_env_var_name("payment.secret_key_env", &self.payment.secret_key_env)?;

        parse_base_url("provisioning.base_url", &self.provisioning.base_url)?;
        validate_env_var_name("provisioning.username_env", &self.provisioning.username_env)?;
        validate_env_var_name("provisioning.password_env", &self.provisioning.password_env)?;

        if let Some(notifier) = &self.notifier {
            parse_base_url("notifier.base_url", &notifier.base_url)?;
            validate_env_var_name("notifier.token_env", &notifier.token_env)?;
        }

        if self.renewal.max_attempts == 0 {
            return Err(EngineError::Config(
                "renewal.max_attempts must be at least 1".to_owned(),
            ));
        }

        for entry in &self.tariffs {
            if entry.price.is_sign_negative() {
                return Err(EngineError::Config(format!(
                    "tariff price for {} cannot be negative",
                    entry.term
                )));
            }
        }

        Ok(())
    }

    /// Builds the tariff table from the configured rows.
    #[must_use]
    pub fn tariff_table(&self) -> TariffTable {
        TariffTable::from_rows(self.tariffs.iter().map(|e| (e.term, e.price)))
    }
}

/// Payment gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentGatewayConfig {
    /// Base URL of the gateway API.
    pub base_url: String,
    /// Environment variable holding the shop/account id.
    pub shop_id_env: String,
    /// Environment variable holding the API secret.
    pub secret_key_env: String,
    /// ISO 4217 currency for all amounts.
    #[serde(default = "default_currency")]
    pub currency: String,
    /// URL the gateway redirects to after the subscriber confirms payment.
    pub return_url: String,
}

/// Provisioning service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    /// Base URL of the provisioning panel API.
    pub base_url: String,
    /// Environment variable holding the panel admin username.
    pub username_env: String,
    /// Environment variable holding the panel admin password.
    pub password_env: String,
    /// Lifetime of a fetched authorization token, in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

/// Notification endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Base URL of the bot API.
    pub base_url: String,
    /// Environment variable holding the bot token.
    pub token_env: String,
}

/// Renewal, retry, and purge policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RenewalConfig {
    /// Seconds between background sweep passes.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Maximum automatic charge attempts per lapsed cycle.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds between charge attempts within a cycle.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Days a lapsed subscription is kept before purge.
    #[serde(default = "default_grace_days")]
    pub grace_days: i64,
}

impl RenewalConfig {
    /// Returns the sweep interval as a duration.
    #[must_use]
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    /// Returns the between-attempt delay as a duration.
    #[must_use]
    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_delay_secs)
    }

    /// Returns the grace window as a calendar duration.
    #[must_use]
    pub fn grace_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.grace_days)
    }

    /// Resolves the config into the runtime policy the reconciler holds.
    #[must_use]
    pub fn policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            sweep_interval: self.sweep_interval(),
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay(),
            grace_window: self.grace_window(),
        }
    }
}

/// Resolved renewal policy, in the units the reconciler consumes.
#[derive(Debug, Clone)]
pub struct RenewalPolicy {
    /// Time between background sweep passes.
    pub sweep_interval: std::time::Duration,
    /// Maximum automatic charge attempts per lapsed cycle.
    pub max_attempts: u32,
    /// Delay between charge attempts within a cycle.
    pub retry_delay: std::time::Duration,
    /// How long a lapsed subscription is kept before purge.
    pub grace_window: chrono::Duration,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay(),
            grace_days: default_grace_days(),
        }
    }
}

/// One tariff row.
#[derive(Debug, Clone, Deserialize)]
pub struct TariffEntry {
    /// Subscription term the price applies to.
    pub term: Term,
    /// Current price per period.
    pub price: Decimal,
}

fn default_currency() -> String {
    "RUB".to_owned()
}

fn default_token_ttl() -> u64 {
    86_400
}

fn default_sweep_interval() -> u64 {
    3_600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    300
}

fn default_grace_days() -> i64 {
    3
}

fn default_tariffs() -> Vec<TariffEntry> {
    vec![
        TariffEntry { term: Term::Month, price: Decimal::from(300) },
        TariffEntry { term: Term::Year, price: Decimal::from(3650) },
    ]
}

fn parse_base_url(field: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| EngineError::Config(format!("invalid {field} '{raw}': {e}")))?;
    if url.host_str().is_none() {
        return Err(EngineError::Config(format!("{field} is missing a host: {raw}")));
    }
    Ok(url)
}

/// Validates an environment variable name: alphanumeric with underscores,
/// starting with a letter or underscore.
fn validate_env_var_name(field: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::Config(format!("{field} cannot be empty")));
    }
    let first = name.chars().next().expect("name is not empty");
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(EngineError::Config(format!(
            "{field} must start with a letter or underscore: {name}"
        )));
    }
    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '_' {
            return Err(EngineError::Config(format!(
                "{field} contains invalid character '{ch}': {name}"
            )));
        }
    }
    Ok(())
}

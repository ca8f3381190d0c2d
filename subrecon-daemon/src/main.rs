//! Reconciliation daemon.
//!
//! Loads configuration, wires the HTTP collaborator clients into a
//! [`Reconciler`], and runs the background renewal/cleanup sweep until the
//! process is stopped. Request-path operations (purchases, webhooks,
//! administrative actions) are served by whatever frontend embeds the
//! engine; this binary owns only the timer-driven side.

mod observability;

use subrecon_engine::{
    EngineError, Reconciler, Result,
    clients::{HttpPaymentGateway, HttpProvisioningClient},
    config::EngineConfig,
    notify::{HttpNotifier, NoopNotifier, Notifier},
    store::{InMemoryStore, SubscriberId},
};
use tracing::{info, warn};

use crate::observability::{HealthCheck, HealthReport, LogFormat, init_observability};

/// Notifier selected by configuration.
#[derive(Debug)]
enum DaemonNotifier {
    /// Deliver through the configured bot endpoint.
    Http(HttpNotifier),
    /// No endpoint configured; drop messages.
    Noop(NoopNotifier),
}

impl Notifier for DaemonNotifier {
    async fn send(&self, to: &SubscriberId, text: &str) -> Result<()> {
        match self {
            Self::Http(inner) => inner.send(to, text).await,
            Self::Noop(inner) => inner.send(to, text).await,
        }
    }
}

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SUBRECON_CONFIG").ok())
        .unwrap_or_else(|| "subrecon.toml".to_owned())
}

/// Startup checks mirroring what `run` is about to construct.
fn startup_checks(path: &str, config: &EngineConfig) -> Vec<HealthCheck> {
    let mut checks = vec![HealthCheck::pass_with_message("config", path)];

    for (name, env_var) in [
        ("payment_shop_id", &config.payment.shop_id_env),
        ("payment_secret", &config.payment.secret_key_env),
        ("provisioning_username", &config.provisioning.username_env),
        ("provisioning_password", &config.provisioning.password_env),
    ] {
        if std::env::var(env_var).is_ok() {
            checks.push(HealthCheck::pass_with_message(name, format!("{env_var} set")));
        } else {
            checks.push(HealthCheck::fail(name, format!("{env_var} not set")));
        }
    }

    match &config.notifier {
        Some(notifier) if std::env::var(&notifier.token_env).is_err() => {
            checks.push(HealthCheck::fail("notifier", format!("{} not set", notifier.token_env)));
        }
        Some(_) => checks.push(HealthCheck::pass_with_message("notifier", "configured")),
        None => checks.push(HealthCheck::warn("notifier", "not configured; messages dropped")),
    }

    checks
}

async fn run(path: &str) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("cannot read {path}: {e}")))?;
    let config = EngineConfig::from_toml(&raw)?;
    config.validate()?;

    let report = HealthReport::from_checks(
        env!("CARGO_PKG_VERSION").to_owned(),
        startup_checks(path, &config),
    );
    match report.to_json() {
        Ok(json) => info!(status = report.status.as_str(), "startup health report:\n{json}"),
        Err(error) => warn!(%error, "failed to serialize startup health report"),
    }

    let notifier = match &config.notifier {
        Some(notifier_config) => DaemonNotifier::Http(HttpNotifier::from_config(notifier_config)?),
        None => DaemonNotifier::Noop(NoopNotifier),
    };

    let engine = Reconciler::new(
        InMemoryStore::new(),
        HttpPaymentGateway::from_config(&config.payment)?,
        HttpProvisioningClient::from_config(&config.provisioning)?,
        notifier,
        config.tariff_table(),
        config.renewal.policy(),
    );

    info!(
        sweep_interval_secs = config.renewal.sweep_interval_secs,
        max_attempts = config.renewal.max_attempts,
        grace_days = config.renewal.grace_days,
        "reconciliation daemon started"
    );

    engine.run().await
}

#[tokio::main]
async fn main() {
    init_observability(LogFormat::from_env());

    let path = config_path();
    if let Err(error) = run(&path).await {
        tracing::error!(%error, config = %path, "daemon failed to start");
        std::process::exit(1);
    }
}

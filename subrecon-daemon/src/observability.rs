//! Observability infrastructure for the reconciliation daemon.
//!
//! Provides structured logging initialization and a startup health report
//! for production deployments.

use std::io;

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log format configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format for development.
    Pretty,
    /// JSON format for production log aggregation.
    Json,
}

impl LogFormat {
    /// Determines log format from environment.
    ///
    /// Checks `LOG_FORMAT`: `json` selects JSON, anything else (or unset)
    /// selects pretty.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").unwrap_or_default().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initializes the tracing subscriber.
///
/// Log level filtering comes from `RUST_LOG` (default: `info`); span close
/// events carry operation timing.
pub fn init_observability(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => {
            subscriber
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_span_events(FmtSpan::CLOSE)
                        .with_writer(io::stderr),
                )
                .init();
        }
        LogFormat::Json => {
            subscriber
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true)
                        .with_span_events(FmtSpan::CLOSE)
                        .with_writer(io::stderr),
                )
                .init();
        }
    }
}

/// Overall health status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Everything required for operation is in place.
    Healthy,
    /// Degraded but operational.
    Degraded,
    /// Not operational.
    Unhealthy,
}

impl HealthStatus {
    /// Returns the string representation for JSON serialization.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Status of one startup check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckStatus {
    /// Check passed.
    Pass,
    /// Check failed.
    Fail,
    /// Check warned; degraded but operational.
    Warn,
}

impl HealthCheckStatus {
    /// Returns the string representation for JSON serialization.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Warn => "warn",
        }
    }
}

/// One startup check result.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Check name.
    pub name: String,
    /// Check status.
    pub status: HealthCheckStatus,
    /// Optional detail message.
    pub message: Option<String>,
}

impl HealthCheck {
    /// Creates a passing check with a message.
    #[must_use]
    pub fn pass_with_message<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self { name: name.into(), status: HealthCheckStatus::Pass, message: Some(message.into()) }
    }

    /// Creates a warning check.
    #[must_use]
    pub fn warn<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self { name: name.into(), status: HealthCheckStatus::Warn, message: Some(message.into()) }
    }

    /// Creates a failing check.
    #[must_use]
    pub fn fail<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self { name: name.into(), status: HealthCheckStatus::Fail, message: Some(message.into()) }
    }
}

/// Startup health report.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall status, derived from the checks.
    pub status: HealthStatus,
    /// Daemon version.
    pub version: String,
    /// Individual checks.
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Builds a report from checks, deriving the overall status.
    #[must_use]
    pub fn from_checks(version: String, checks: Vec<HealthCheck>) -> Self {
        Self { status: Self::compute_status(&checks), version, checks }
    }

    /// Derives overall health from individual checks.
    #[must_use]
    pub fn compute_status(checks: &[HealthCheck]) -> HealthStatus {
        if checks.iter().any(|c| c.status == HealthCheckStatus::Fail) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.status == HealthCheckStatus::Warn) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Serializes the report to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::json!({
            "status": self.status.as_str(),
            "version": self.version,
            "checks": self.checks.iter().map(|c| {
                let mut obj = serde_json::json!({
                    "name": c.name,
                    "status": c.status.as_str(),
                });
                if let Some(msg) = &c.message {
                    obj["message"] = serde_json::Value::String(msg.clone());
                }
                obj
            }).collect::<Vec<_>>(),
        });

        serde_json::to_string_pretty(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_env() {
        // SAFETY: this test is the only reader/writer of LOG_FORMAT and runs
        // in its own process-wide critical section by test isolation.
        unsafe {
            std::env::remove_var("LOG_FORMAT");
            assert_eq!(LogFormat::from_env(), LogFormat::Pretty);

            std::env::set_var("LOG_FORMAT", "json");
            assert_eq!(LogFormat::from_env(), LogFormat::Json);

            std::env::set_var("LOG_FORMAT", "unknown");
            assert_eq!(LogFormat::from_env(), LogFormat::Pretty);

            std::env::remove_var("LOG_FORMAT");
        }
    }

    #[test]
    fn test_compute_status() {
        let pass = HealthCheck::pass_with_message("config", "loaded");
        let warn = HealthCheck::warn("notifier", "not configured");
        let fail = HealthCheck::fail("payment", "credentials missing");

        assert_eq!(HealthReport::compute_status(&[pass.clone()]), HealthStatus::Healthy);
        assert_eq!(
            HealthReport::compute_status(&[pass.clone(), warn.clone()]),
            HealthStatus::Degraded
        );
        assert_eq!(HealthReport::compute_status(&[pass, warn, fail]), HealthStatus::Unhealthy);
        assert_eq!(HealthReport::compute_status(&[]), HealthStatus::Healthy);
    }

    #[test]
    fn test_report_to_json() {
        let report = HealthReport::from_checks(
            "0.1.0".to_owned(),
            vec![
                HealthCheck::pass_with_message("config", "subrecon.toml"),
                HealthCheck::fail("payment", "SHOP_ID not set"),
            ],
        );

        let json = report.to_json().expect("JSON serialization should succeed");
        assert!(json.contains("\"status\": \"unhealthy\""));
        assert!(json.contains("\"name\": \"config\""));
        assert!(json.contains("\"message\": \"SHOP_ID not set\""));
    }
}

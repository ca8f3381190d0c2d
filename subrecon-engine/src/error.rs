//! Error types for the reconciliation engine.
//!
//! All fallible engine operations return [`Result`], with [`EngineError`]
//! carrying enough context for the transaction log to support manual
//! reconciliation after the fact.
//!
//! # Error Categories
//!
//! - **Transport** ([`EngineError::Http`]): network/HTTP failures calling the
//!   payment or provisioning service
//! - **Protocol** ([`EngineError::Gateway`]): a collaborator answered with a
//!   non-success status or an unparsable body
//! - **Authorization** ([`EngineError::Auth`]): provisioning token fetch
//!   failed; fatal to the calling operation, never retried inline
//! - **Stale request** ([`EngineError::IntentNotFound`]): confirmation for an
//!   unknown or already-consumed payment id; no state change results
//! - **Validation** ([`EngineError::InvalidSubscriberId`],
//!   [`EngineError::Config`]): bad input, fix and retry

use thiserror::Error;

use crate::store::models::Term;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while reconciling subscriptions.
#[must_use = "errors should be handled, propagated, or recorded in the transaction log"]
#[derive(Debug, Error)]
pub enum EngineError {
    /// HTTP request failed.
    ///
    /// Wraps [`reqwest::Error`]: timeouts, connection failures, DNS and TLS
    /// errors. Transient by nature; bounded retry policies apply.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A gateway answered outside its contract.
    ///
    /// Non-2xx status codes and malformed response bodies from the payment
    /// or provisioning service both land here.
    #[error("unexpected gateway response: {0}")]
    Gateway(String),

    /// Authorization token could not be obtained from the provisioning
    /// service.
    ///
    /// Fatal to the immediate operation. The caller's own retry policy
    /// governs whether the operation is attempted again later.
    #[error("provisioning authorization failed: {0}")]
    Auth(String),

    /// No pending payment matches the given id for this subscriber.
    ///
    /// Raised for stale or replayed confirmation callbacks; the engine makes
    /// no state change in response.
    #[error("no pending payment matches id {0}")]
    IntentNotFound(String),

    /// Subscriber id failed validation.
    ///
    /// Ids must be non-empty, at most 64 characters, and contain only
    /// alphanumeric characters, hyphens, and underscores.
    #[error("invalid subscriber id: {0}")]
    InvalidSubscriberId(String),

    /// No tariff row exists for the requested subscription term.
    #[error("no tariff is configured for {0} subscriptions")]
    MissingTariff(Term),

    /// Configuration was rejected during load or validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The persistent store reported a failure.
    #[error("store operation failed: {0}")]
    Store(String),
}

impl EngineError {
    /// Returns `true` for failures that may succeed if simply attempted
    /// again.
    ///
    /// Transient means HTTP timeouts, connection failures, and server-side
    /// (5xx) errors. Validation, authorization, and stale-request errors are
    /// never transient: repeating them unchanged repeats the failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            Self::Gateway(_)
            | Self::Auth(_)
            | Self::IntentNotFound(_)
            | Self::InvalidSubscriberId(_)
            | Self::MissingTariff(_)
            | Self::Config(_)
            | Self::Store(_) => false,
        }
    }
}

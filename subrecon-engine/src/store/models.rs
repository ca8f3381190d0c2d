//! Persistent record types for subscribers, pending payments, and the
//! transaction log.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Stable subscriber identity.
///
/// Wraps the externally-issued user id with type safety.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Creates a new subscriber id after validation.
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty, exceeds 64 characters, or contains
    /// invalid characters. Only alphanumeric characters, hyphens, and
    /// underscores are allowed.
    pub fn new<S: Into<String>>(id: S) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(EngineError::InvalidSubscriberId("subscriber id cannot be empty".into()));
        }
        if id.len() > 64 {
            return Err(EngineError::InvalidSubscriberId(
                "subscriber id must be 64 characters or less".into(),
            ));
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(EngineError::InvalidSubscriberId(
                "subscriber id can only contain alphanumeric characters, hyphens, and underscores"
                    .into(),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a payment method retained by the gateway.
///
/// Obtained from a successful charge that saved the method; never inspected
/// by the engine, only passed back for automatic renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodToken(String);

impl PaymentMethodToken {
    /// Wraps a gateway-issued payment method id.
    #[must_use]
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Subscription term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    /// Monthly subscription, 30 days per period.
    Month,
    /// Annual subscription, 365 days per period.
    Year,
    /// Administratively granted access with an explicit duration.
    Manual,
}

impl Term {
    /// Returns the billing period length, or `None` for manual grants whose
    /// duration is always supplied explicitly.
    #[must_use]
    pub fn period(&self) -> Option<chrono::Duration> {
        match self {
            Self::Month => Some(chrono::Duration::days(30)),
            Self::Year => Some(chrono::Duration::days(365)),
            Self::Manual => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Month => "month",
            Self::Year => "year",
            Self::Manual => "manual",
        })
    }
}

/// Persistent per-subscriber record.
///
/// Invariant: `subscription_end` present implies `term` present. A subscriber
/// with no successful payment has both absent. The record is mutated only by
/// the reconciler's activation, renewal, and reset operations, and removed
/// only by the grace-period purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Stable identity.
    pub id: SubscriberId,
    /// Identity used with the provisioning service; defaults to `id` when
    /// unset.
    pub account_handle: Option<String>,
    /// Current subscription term, absent while unsubscribed.
    pub term: Option<Term>,
    /// Expiry of the paid period, absent while unsubscribed.
    pub subscription_end: Option<DateTime<Utc>>,
    /// Retained payment method, absent until a charge saved one.
    pub payment_method: Option<PaymentMethodToken>,
}

impl Subscriber {
    /// Creates a fresh, unsubscribed record.
    #[must_use]
    pub fn new(id: SubscriberId, account_handle: Option<String>) -> Self {
        Self { id, account_handle, term: None, subscription_end: None, payment_method: None }
    }

    /// Resolves the provisioning identity for this subscriber.
    #[must_use]
    pub fn handle(&self) -> &str {
        self.account_handle.as_deref().unwrap_or_else(|| self.id.as_str())
    }

    /// Applies a paid activation or renewal.
    ///
    /// The payment method is only overwritten when the charge retained one;
    /// an activation without a saved method keeps whatever was stored before.
    pub fn activate(&mut self, term: Term, end: DateTime<Utc>, method: Option<PaymentMethodToken>) {
        self.term = Some(term);
        self.subscription_end = Some(end);
        if method.is_some() {
            self.payment_method = method;
        }
    }

    /// Clears all subscription fields, returning the record to the
    /// unsubscribed shape.
    pub fn clear_subscription(&mut self) {
        self.term = None;
        self.subscription_end = None;
        self.payment_method = None;
    }

    /// Returns `true` while the paid period covers `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.subscription_end.is_some_and(|end| end > now)
    }
}

/// Outstanding payment intent for a subscriber.
///
/// At most one live entry exists per subscriber. Created by purchase
/// initiation; destroyed exactly once, by successful confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPayment {
    /// Gateway-issued payment id.
    pub payment_id: String,
    /// Subscriber who initiated the purchase.
    pub subscriber_id: SubscriberId,
    /// Term selected at purchase time; activation uses this, not a live
    /// lookup, to stay consistent with what was actually charged.
    pub term: Term,
    /// Amount captured at purchase time.
    pub amount: Decimal,
    /// URL the subscriber must visit to confirm the payment.
    pub confirmation_url: String,
    /// Intent creation time.
    pub created_at: DateTime<Utc>,
}

/// Outcome class of a logged state-transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Transition started and is still in flight.
    Processing,
    /// Transition completed.
    Success,
    /// Transition failed.
    Error,
}

/// Append-only audit record of one state-transition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    /// Unique correlation id for this entry.
    pub id: Uuid,
    /// Subscriber the transition concerned.
    pub subscriber_id: SubscriberId,
    /// Outcome class.
    pub status: TransactionStatus,
    /// Human-readable context: attempted amount/term, raw error text.
    pub message: String,
    /// Entry creation time.
    pub timestamp: DateTime<Utc>,
}

impl TransactionEntry {
    /// Creates a new entry stamped with a fresh correlation id and the
    /// current time.
    #[must_use]
    pub fn new<S: Into<String>>(
        subscriber_id: SubscriberId,
        status: TransactionStatus,
        message: S,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriber_id,
            status,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

//! Subscription state derivation.
//!
//! The persistent record stores only the term, expiry, and retained payment
//! method; the lifecycle state is derived from those plus the clock and the
//! purge policy. Exhausted-retry resets are represented by the reset record
//! itself, so there is no stored "final" state to get out of sync.

use chrono::{DateTime, Utc};

use crate::store::models::Subscriber;

/// Lifecycle position of a subscriber at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No paid period, or the period ended and nothing will renew it
    /// automatically.
    Unsubscribed,
    /// The paid period covers now.
    Active,
    /// The paid period ended, a payment method is retained, and the grace
    /// window has not passed: automatic renewal applies.
    LapsedRetrying,
    /// The paid period ended more than the grace window ago: the record and
    /// remote account are due for removal.
    PurgeEligible,
}

impl SubscriptionState {
    /// Derives the state of a record at `now` under the given grace window.
    #[must_use]
    pub fn derive(subscriber: &Subscriber, now: DateTime<Utc>, grace: chrono::Duration) -> Self {
        let Some(end) = subscriber.subscription_end else {
            return Self::Unsubscribed;
        };
        if end > now {
            return Self::Active;
        }
        if end + grace < now {
            return Self::PurgeEligible;
        }
        if subscriber.payment_method.is_some() {
            Self::LapsedRetrying
        } else {
            Self::Unsubscribed
        }
    }
}

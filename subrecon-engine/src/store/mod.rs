//! Persistence boundary: subscriber records, the pending payment ledger,
//! and the append-only transaction log.
//!
//! The [`Store`] trait is the single seam between the reconciler and
//! whatever holds its state. Implementations must make the ledger
//! check-and-insert and take operations atomic per subscriber, and honor the
//! compare-and-swap contract of [`Store::apply_renewal`]; these are the
//! operations the cross-system consistency guarantees rest on.

pub mod memory;
pub mod models;

use chrono::{DateTime, Utc};

pub use memory::InMemoryStore;
pub use models::{
    PaymentMethodToken, PendingPayment, Subscriber, SubscriberId, Term, TransactionEntry,
    TransactionStatus,
};

use crate::error::Result;

/// Outcome of a ledger check-and-insert.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerInsert {
    /// No live entry existed; the new one was recorded.
    Inserted,
    /// A live entry already existed and is returned unchanged.
    Existing(PendingPayment),
}

/// Persistent state consumed and mutated by the reconciler.
pub trait Store: Send + Sync {
    /// Inserts a subscriber record if none exists for its id.
    ///
    /// Returns `false` when the record was already present (the insert is
    /// ignored, matching first-contact registration semantics).
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn insert_subscriber(&self, subscriber: Subscriber) -> Result<bool>;

    /// Reads a subscriber record.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn subscriber(&self, id: &SubscriberId) -> Result<Option<Subscriber>>;

    /// Applies a paid activation, creating the record if absent.
    ///
    /// The payment method is only overwritten when `method` is present.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn apply_activation(
        &self,
        id: &SubscriberId,
        term: Term,
        end: DateTime<Utc>,
        method: Option<PaymentMethodToken>,
    ) -> Result<()>;

    /// Conditionally applies an automatic renewal.
    ///
    /// Writes the new term and end only if `subscription_end` still equals
    /// `observed_end`; returns `false` (and writes nothing) otherwise. This
    /// is the compare-and-swap that keeps a concurrent manual renewal from
    /// being silently overwritten.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn apply_renewal(
        &self,
        id: &SubscriberId,
        observed_end: Option<DateTime<Utc>>,
        term: Term,
        new_end: DateTime<Utc>,
    ) -> Result<bool>;

    /// Clears a subscriber's term, end, and payment method.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn clear_subscription(&self, id: &SubscriberId) -> Result<()>;

    /// Deletes a subscriber record entirely, along with any pending payment.
    ///
    /// Returns `false` when no record existed.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn remove_subscriber(&self, id: &SubscriberId) -> Result<bool>;

    /// Lists subscribers whose paid period has ended and who hold a retained
    /// payment method: the automatic-renewal candidates.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn lapsed_with_method(&self, now: DateTime<Utc>) -> Result<Vec<Subscriber>>;

    /// Lists subscribers whose paid period ended before `cutoff`: the purge
    /// candidates.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn lapsed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Subscriber>>;

    /// Reads the live pending payment for a subscriber, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn pending_for(&self, id: &SubscriberId) -> Result<Option<PendingPayment>>;

    /// Atomically records a pending payment unless one already exists for
    /// the subscriber.
    ///
    /// This is the single authoritative check-and-insert that serializes
    /// concurrent purchase initiation.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn insert_pending_if_absent(&self, pending: PendingPayment) -> Result<LedgerInsert>;

    /// Atomically removes and returns the pending payment matching
    /// `payment_id`, if present.
    ///
    /// Exactly one caller can win this take; every later call observes
    /// absence. Activation idempotency rests on this.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn take_pending(
        &self,
        id: &SubscriberId,
        payment_id: &str,
    ) -> Result<Option<PendingPayment>>;

    /// Appends an entry to the transaction log.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying store fails.
    async fn record(&self, entry: TransactionEntry) -> Result<()>;
}

//! In-memory store implementation.
//!
//! Each table lives behind its own `tokio::sync::RwLock`; no lock is held
//! across an await point, so every trait operation is a single critical
//! section. Suitable for tests and single-process deployments.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    LedgerInsert, Store,
    models::{
        PaymentMethodToken, PendingPayment, Subscriber, SubscriberId, Term, TransactionEntry,
    },
};
use crate::error::Result;

/// Store backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    pending: RwLock<HashMap<SubscriberId, PendingPayment>>,
    log: RwLock<Vec<TransactionEntry>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the transaction log, oldest first.
    pub async fn transactions(&self) -> Vec<TransactionEntry> {
        self.log.read().await.clone()
    }

    /// Returns the number of subscriber records.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Returns the number of live pending payments.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

impl Store for InMemoryStore {
    async fn insert_subscriber(&self, subscriber: Subscriber) -> Result<bool> {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.contains_key(&subscriber.id) {
            return Ok(false);
        }
        subscribers.insert(subscriber.id.clone(), subscriber);
        Ok(true)
    }

    async fn subscriber(&self, id: &SubscriberId) -> Result<Option<Subscriber>> {
        Ok(self.subscribers.read().await.get(id).cloned())
    }

    async fn apply_activation(
        &self,
        id: &SubscriberId,
        term: Term,
        end: DateTime<Utc>,
        method: Option<PaymentMethodToken>,
    ) -> Result<()> {
        let mut subscribers = self.subscribers.write().await;
        let record = subscribers
            .entry(id.clone())
            .or_insert_with(|| Subscriber::new(id.clone(), None));
        record.activate(term, end, method);
        Ok(())
    }

    async fn apply_renewal(
        &self,
        id: &SubscriberId,
        observed_end: Option<DateTime<Utc>>,
        term: Term,
        new_end: DateTime<Utc>,
    ) -> Result<bool> {
        let mut subscribers = self.subscribers.write().await;
        let Some(record) = subscribers.get_mut(id) else {
            return Ok(false);
        };
        if record.subscription_end != observed_end {
            return Ok(false);
        }
        record.activate(term, new_end, None);
        Ok(true)
    }

    async fn clear_subscription(&self, id: &SubscriberId) -> Result<()> {
        if let Some(record) = self.subscribers.write().await.get_mut(id) {
            record.clear_subscription();
        }
        Ok(())
    }

    async fn remove_subscriber(&self, id: &SubscriberId) -> Result<bool> {
        self.pending.write().await.remove(id);
        Ok(self.subscribers.write().await.remove(id).is_some())
    }

    async fn lapsed_with_method(&self, now: DateTime<Utc>) -> Result<Vec<Subscriber>> {
        Ok(self
            .subscribers
            .read()
            .await
            .values()
            .filter(|s| s.subscription_end.is_some_and(|end| end < now) && s.payment_method.is_some())
            .cloned()
            .collect())
    }

    async fn lapsed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Subscriber>> {
        Ok(self
            .subscribers
            .read()
            .await
            .values()
            .filter(|s| s.subscription_end.is_some_and(|end| end < cutoff))
            .cloned()
            .collect())
    }

    async fn pending_for(&self, id: &SubscriberId) -> Result<Option<PendingPayment>> {
        Ok(self.pending.read().await.get(id).cloned())
    }

    async fn insert_pending_if_absent(&self, pending: PendingPayment) -> Result<LedgerInsert> {
        let mut ledger = self.pending.write().await;
        if let Some(existing) = ledger.get(&pending.subscriber_id) {
            return Ok(LedgerInsert::Existing(existing.clone()));
        }
        ledger.insert(pending.subscriber_id.clone(), pending);
        Ok(LedgerInsert::Inserted)
    }

    async fn take_pending(
        &self,
        id: &SubscriberId,
        payment_id: &str,
    ) -> Result<Option<PendingPayment>> {
        let mut ledger = self.pending.write().await;
        if ledger.get(id).is_some_and(|p| p.payment_id == payment_id) {
            return Ok(ledger.remove(id));
        }
        Ok(None)
    }

    async fn record(&self, entry: TransactionEntry) -> Result<()> {
        self.log.write().await.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::store::models::TransactionStatus;

    fn subscriber_id(raw: &str) -> SubscriberId {
        SubscriberId::new(raw).unwrap()
    }

    fn pending(raw_id: &str, payment_id: &str) -> PendingPayment {
        PendingPayment {
            payment_id: payment_id.to_owned(),
            subscriber_id: subscriber_id(raw_id),
            term: Term::Month,
            amount: Decimal::from(300),
            confirmation_url: "https://pay.example.com/confirm/1".to_owned(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_subscriber_is_idempotent() {
        let store = InMemoryStore::new();
        let sub = Subscriber::new(subscriber_id("u1"), None);

        assert!(store.insert_subscriber(sub.clone()).await.unwrap());
        assert!(!store.insert_subscriber(sub).await.unwrap());
        assert_eq!(store.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_second_insert_does_not_overwrite() {
        let store = InMemoryStore::new();
        let id = subscriber_id("u1");
        store.insert_subscriber(Subscriber::new(id.clone(), None)).await.unwrap();
        store
            .apply_activation(&id, Term::Month, Utc::now() + chrono::Duration::days(30), None)
            .await
            .unwrap();

        store.insert_subscriber(Subscriber::new(id.clone(), None)).await.unwrap();
        let record = store.subscriber(&id).await.unwrap().unwrap();
        assert_eq!(record.term, Some(Term::Month));
    }

    #[tokio::test]
    async fn test_activation_upserts_missing_record() {
        let store = InMemoryStore::new();
        let id = subscriber_id("u1");
        let end = Utc::now() + chrono::Duration::days(30);

        store
            .apply_activation(&id, Term::Month, end, Some(PaymentMethodToken::new("pm-1")))
            .await
            .unwrap();

        let record = store.subscriber(&id).await.unwrap().unwrap();
        assert_eq!(record.subscription_end, Some(end));
        assert_eq!(record.payment_method, Some(PaymentMethodToken::new("pm-1")));
    }

    #[tokio::test]
    async fn test_renewal_cas_succeeds_on_observed_end() {
        let store = InMemoryStore::new();
        let id = subscriber_id("u1");
        let old_end = Utc::now() - chrono::Duration::days(1);
        store.apply_activation(&id, Term::Month, old_end, None).await.unwrap();

        let new_end = Utc::now() + chrono::Duration::days(30);
        let written = store.apply_renewal(&id, Some(old_end), Term::Month, new_end).await.unwrap();

        assert!(written);
        let record = store.subscriber(&id).await.unwrap().unwrap();
        assert_eq!(record.subscription_end, Some(new_end));
    }

    #[tokio::test]
    async fn test_renewal_cas_rejects_stale_observation() {
        let store = InMemoryStore::new();
        let id = subscriber_id("u1");
        let current_end = Utc::now() + chrono::Duration::days(10);
        store.apply_activation(&id, Term::Month, current_end, None).await.unwrap();

        let stale = Some(Utc::now() - chrono::Duration::days(1));
        let new_end = Utc::now() + chrono::Duration::days(30);
        let written = store.apply_renewal(&id, stale, Term::Month, new_end).await.unwrap();

        assert!(!written);
        let record = store.subscriber(&id).await.unwrap().unwrap();
        assert_eq!(record.subscription_end, Some(current_end));
    }

    #[tokio::test]
    async fn test_renewal_cas_missing_record() {
        let store = InMemoryStore::new();
        let written = store
            .apply_renewal(&subscriber_id("ghost"), None, Term::Month, Utc::now())
            .await
            .unwrap();
        assert!(!written);
    }

    #[tokio::test]
    async fn test_clear_subscription() {
        let store = InMemoryStore::new();
        let id = subscriber_id("u1");
        store
            .apply_activation(&id, Term::Year, Utc::now(), Some(PaymentMethodToken::new("pm-1")))
            .await
            .unwrap();

        store.clear_subscription(&id).await.unwrap();

        let record = store.subscriber(&id).await.unwrap().unwrap();
        assert!(record.term.is_none());
        assert!(record.subscription_end.is_none());
        assert!(record.payment_method.is_none());
    }

    #[tokio::test]
    async fn test_remove_subscriber_drops_pending() {
        let store = InMemoryStore::new();
        let id = subscriber_id("u1");
        store.insert_subscriber(Subscriber::new(id.clone(), None)).await.unwrap();
        store.insert_pending_if_absent(pending("u1", "pay-1")).await.unwrap();

        assert!(store.remove_subscriber(&id).await.unwrap());
        assert_eq!(store.pending_count().await, 0);
        assert!(!store.remove_subscriber(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lapsed_queries() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let with_method = subscriber_id("renewable");
        store
            .apply_activation(
                &with_method,
                Term::Month,
                now - chrono::Duration::days(1),
                Some(PaymentMethodToken::new("pm-1")),
            )
            .await
            .unwrap();

        let without_method = subscriber_id("expired");
        store
            .apply_activation(&without_method, Term::Month, now - chrono::Duration::days(4), None)
            .await
            .unwrap();

        let active = subscriber_id("active");
        store
            .apply_activation(
                &active,
                Term::Year,
                now + chrono::Duration::days(100),
                Some(PaymentMethodToken::new("pm-2")),
            )
            .await
            .unwrap();

        let renewable = store.lapsed_with_method(now).await.unwrap();
        assert_eq!(renewable.len(), 1);
        assert_eq!(renewable[0].id, with_method);

        let purgeable = store.lapsed_before(now - chrono::Duration::days(3)).await.unwrap();
        assert_eq!(purgeable.len(), 1);
        assert_eq!(purgeable[0].id, without_method);
    }

    #[tokio::test]
    async fn test_ledger_check_and_insert() {
        let store = InMemoryStore::new();

        let first = store.insert_pending_if_absent(pending("u1", "pay-1")).await.unwrap();
        assert_eq!(first, LedgerInsert::Inserted);

        let second = store.insert_pending_if_absent(pending("u1", "pay-2")).await.unwrap();
        let LedgerInsert::Existing(existing) = second else {
            panic!("expected existing entry");
        };
        assert_eq!(existing.payment_id, "pay-1");
        assert_eq!(store.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_take_pending_is_exclusive() {
        let store = InMemoryStore::new();
        let id = subscriber_id("u1");
        store.insert_pending_if_absent(pending("u1", "pay-1")).await.unwrap();

        let taken = store.take_pending(&id, "pay-1").await.unwrap();
        assert!(taken.is_some());

        let again = store.take_pending(&id, "pay-1").await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_take_pending_wrong_id_leaves_entry() {
        let store = InMemoryStore::new();
        let id = subscriber_id("u1");
        store.insert_pending_if_absent(pending("u1", "pay-1")).await.unwrap();

        let taken = store.take_pending(&id, "pay-other").await.unwrap();
        assert!(taken.is_none());
        assert_eq!(store.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_log_is_append_only() {
        let store = InMemoryStore::new();
        let id = subscriber_id("u1");

        store
            .record(TransactionEntry::new(id.clone(), TransactionStatus::Processing, "first"))
            .await
            .unwrap();
        store
            .record(TransactionEntry::new(id, TransactionStatus::Success, "second"))
            .await
            .unwrap();

        let log = store.transactions().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "first");
        assert_eq!(log[1].message, "second");
        assert_ne!(log[0].id, log[1].id);
    }
}

//! End-to-end reconciler tests against in-process collaborators.
//!
//! Exercises the public engine API the way a frontend and the background
//! sweep use it: purchase initiation and confirmation, webhook activation,
//! bounded automatic renewal, and grace-period purge.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU32, Ordering},
};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use subrecon_engine::{
    ConfirmOutcome, Reconciler, Result, WebhookOutcome,
    clients::{
        ChargeOutcome, IntentState, IntentStatus, PaymentGateway, PaymentIntent, ProvisioningApi,
        RemoteAccount, WebhookEnvelope,
    },
    config::RenewalPolicy,
    error::EngineError,
    notify::Notifier,
    store::{InMemoryStore, PaymentMethodToken, Store, SubscriberId, Term, TransactionStatus},
    tariff::TariffTable,
};
use tokio::sync::Mutex;

// ============================================================================
// Test collaborators
// ============================================================================

#[derive(Debug, Default)]
struct ScriptedGateway {
    created: AtomicU32,
    statuses: Mutex<HashMap<String, IntentState>>,
    charge_script: Mutex<VecDeque<Result<ChargeOutcome>>>,
    charge_calls: AtomicU32,
}

impl ScriptedGateway {
    async fn settle(&self, payment_id: &str, method: Option<&str>) {
        self.statuses.lock().await.insert(
            payment_id.to_owned(),
            IntentState {
                status: IntentStatus::Succeeded,
                payment_method: method.map(PaymentMethodToken::new),
            },
        );
    }

    async fn script(&self, outcomes: Vec<Result<ChargeOutcome>>) {
        *self.charge_script.lock().await = outcomes.into();
    }
}

impl PaymentGateway for ScriptedGateway {
    async fn create_intent(
        &self,
        _amount: Decimal,
        _subscriber: &SubscriberId,
        _description: &str,
    ) -> Result<PaymentIntent> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PaymentIntent {
            id: format!("pay-{n}"),
            confirmation_url: format!("https://pay.example.com/confirm/{n}"),
        })
    }

    async fn intent_status(&self, payment_id: &str) -> Result<IntentState> {
        Ok(self
            .statuses
            .lock()
            .await
            .get(payment_id)
            .cloned()
            .unwrap_or(IntentState { status: IntentStatus::Pending, payment_method: None }))
    }

    async fn charge_stored_method(
        &self,
        _method: &PaymentMethodToken,
        _amount: Decimal,
        _subscriber: &SubscriberId,
        _description: &str,
    ) -> Result<ChargeOutcome> {
        self.charge_calls.fetch_add(1, Ordering::SeqCst);
        self.charge_script.lock().await.pop_front().unwrap_or(Ok(ChargeOutcome::Succeeded))
    }
}

#[derive(Debug, Default)]
struct PanelFake {
    accounts: Mutex<HashMap<String, RemoteAccount>>,
    creates: AtomicU32,
    deletes: AtomicU32,
}

impl ProvisioningApi for PanelFake {
    async fn fetch(&self, handle: &str) -> Result<Option<RemoteAccount>> {
        Ok(self.accounts.lock().await.get(handle).cloned())
    }

    async fn create(&self, handle: &str, expires_at: DateTime<Utc>) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let url = format!("https://panel.example.com/sub/{handle}");
        self.accounts.lock().await.insert(
            handle.to_owned(),
            RemoteAccount { expires_at: Some(expires_at), access_url: url.clone() },
        );
        Ok(url)
    }

    async fn extend(&self, handle: &str, new_expires_at: DateTime<Utc>) -> Result<String> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(handle)
            .ok_or_else(|| EngineError::Gateway(format!("account {handle} not found")))?;
        account.expires_at = Some(new_expires_at);
        Ok(account.access_url.clone())
    }

    async fn pause(&self, _handle: &str) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.accounts.lock().await.remove(handle);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Outbox {
    messages: Mutex<Vec<String>>,
}

impl Notifier for Outbox {
    async fn send(&self, _to: &SubscriberId, text: &str) -> Result<()> {
        self.messages.lock().await.push(text.to_owned());
        Ok(())
    }
}

type TestEngine = Reconciler<InMemoryStore, ScriptedGateway, PanelFake, Outbox>;

fn engine() -> TestEngine {
    Reconciler::new(
        InMemoryStore::new(),
        ScriptedGateway::default(),
        PanelFake::default(),
        Outbox::default(),
        TariffTable::default(),
        RenewalPolicy {
            sweep_interval: std::time::Duration::from_secs(3600),
            max_attempts: 3,
            retry_delay: std::time::Duration::from_millis(5),
            grace_window: chrono::Duration::days(3),
        },
    )
}

fn subscriber(raw: &str) -> SubscriberId {
    SubscriberId::new(raw).unwrap()
}

async fn assert_record_invariant(engine: &TestEngine, id: &SubscriberId) {
    if let Some(record) = engine.store().subscriber(id).await.unwrap() {
        assert!(
            record.subscription_end.is_none() || record.term.is_some(),
            "record for {id} has an end date without a term"
        );
    }
}

// ============================================================================
// Purchase flow
// ============================================================================

#[tokio::test]
async fn test_first_purchase_activates_month_subscription() {
    let engine = engine();
    let u1 = subscriber("U1");

    // No record yet; initiation still works and captures the month price.
    let pending = engine.initiate_purchase(&u1, Term::Month).await.unwrap();
    assert_eq!(pending.amount, Decimal::from(300));
    assert_record_invariant(&engine, &u1).await;

    engine.payments().settle(&pending.payment_id, Some("pm-u1")).await;
    let before = Utc::now();
    let outcome = engine.confirm_purchase(&u1, &pending.payment_id).await.unwrap();

    let ConfirmOutcome::Activated(activation) = outcome else {
        panic!("expected activation, got {outcome:?}");
    };
    assert!(activation.expires_at >= before + chrono::Duration::days(30));
    assert!(activation.expires_at <= Utc::now() + chrono::Duration::days(31));

    let record = engine.store().subscriber(&u1).await.unwrap().unwrap();
    assert_eq!(record.term, Some(Term::Month));
    assert_eq!(record.payment_method, Some(PaymentMethodToken::new("pm-u1")));
    assert_eq!(engine.store().pending_for(&u1).await.unwrap(), None);
    assert_eq!(engine.provisioning().creates.load(Ordering::SeqCst), 1);
    assert_record_invariant(&engine, &u1).await;
}

#[tokio::test]
async fn test_repeated_initiation_returns_same_intent() {
    let engine = engine();
    let u1 = subscriber("U1");

    let first = engine.initiate_purchase(&u1, Term::Month).await.unwrap();
    let second = engine.initiate_purchase(&u1, Term::Month).await.unwrap();

    assert_eq!(first.payment_id, second.payment_id);
    assert_eq!(first.confirmation_url, second.confirmation_url);
    assert_eq!(engine.payments().created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_confirmation_is_rejected_without_state_change() {
    let engine = engine();
    let u1 = subscriber("U1");
    engine.initiate_purchase(&u1, Term::Month).await.unwrap();

    let result = engine.confirm_purchase(&u1, "pay-replayed").await;

    assert!(matches!(result.unwrap_err(), EngineError::IntentNotFound(_)));
    assert!(engine.store().pending_for(&u1).await.unwrap().is_some());
    assert!(engine.store().subscriber(&u1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_webhook_delivered_twice_activates_once() {
    let engine = engine();
    let u1 = subscriber("U1");
    let pending = engine.initiate_purchase(&u1, Term::Month).await.unwrap();

    let body = format!(
        r#"{{
            "event": "payment.succeeded",
            "object": {{
                "id": "{}",
                "amount": {{"value": "300.00", "currency": "RUB"}},
                "metadata": {{"user_id": "U1"}},
                "payment_method": {{"id": "pm-u1"}}
            }}
        }}"#,
        pending.payment_id
    );

    let first: WebhookEnvelope = serde_json::from_str(&body).unwrap();
    let second: WebhookEnvelope = serde_json::from_str(&body).unwrap();

    let WebhookOutcome::Activated(activation) = engine.handle_webhook(first).await.unwrap() else {
        panic!("expected activation");
    };
    assert_eq!(engine.handle_webhook(second).await.unwrap(), WebhookOutcome::AlreadyHandled);

    // One subscription_end write, one provisioning call, one ledger removal.
    let record = engine.store().subscriber(&u1).await.unwrap().unwrap();
    assert_eq!(record.subscription_end, Some(activation.expires_at));
    assert_eq!(engine.provisioning().creates.load(Ordering::SeqCst), 1);
    assert_eq!(engine.store().pending_for(&u1).await.unwrap(), None);
}

// ============================================================================
// Automatic renewal
// ============================================================================

#[tokio::test]
async fn test_renewal_succeeds_on_third_attempt() {
    let engine = engine();
    let u2 = subscriber("U2");
    let yesterday = Utc::now() - chrono::Duration::days(1);
    engine
        .store()
        .apply_activation(&u2, Term::Month, yesterday, Some(PaymentMethodToken::new("pm-u2")))
        .await
        .unwrap();
    engine
        .payments()
        .script(vec![
            Ok(ChargeOutcome::Failed("insufficient_funds".to_owned())),
            Ok(ChargeOutcome::Failed("insufficient_funds".to_owned())),
            Ok(ChargeOutcome::Succeeded),
        ])
        .await;

    let before = Utc::now();
    let report = engine.sweep_once(Utc::now()).await;

    assert_eq!(report.renewed, 1);
    assert_eq!(engine.payments().charge_calls.load(Ordering::SeqCst), 3);

    let record = engine.store().subscriber(&u2).await.unwrap().unwrap();
    assert!(record.subscription_end.unwrap() >= before + chrono::Duration::days(29));
    assert_record_invariant(&engine, &u2).await;

    let log = engine.store().transactions().await;
    let for_u2: Vec<_> = log.iter().filter(|e| e.subscriber_id == u2).collect();
    assert_eq!(for_u2.iter().filter(|e| e.status == TransactionStatus::Error).count(), 2);
    assert_eq!(for_u2.iter().filter(|e| e.status == TransactionStatus::Success).count(), 1);

    assert_eq!(engine.notifier().messages.lock().await.len(), 1);
}

#[tokio::test]
async fn test_renewal_exhaustion_clears_subscription_once() {
    let engine = engine();
    let u2 = subscriber("U2");
    engine
        .store()
        .apply_activation(
            &u2,
            Term::Month,
            Utc::now() - chrono::Duration::days(1),
            Some(PaymentMethodToken::new("pm-u2")),
        )
        .await
        .unwrap();
    engine
        .payments()
        .script(vec![
            Ok(ChargeOutcome::Failed("declined".to_owned())),
            Ok(ChargeOutcome::Failed("declined".to_owned())),
            Ok(ChargeOutcome::Failed("declined".to_owned())),
        ])
        .await;

    let report = engine.sweep_once(Utc::now()).await;

    assert_eq!(report.reset, 1);
    assert_eq!(engine.payments().charge_calls.load(Ordering::SeqCst), 3);

    let record = engine.store().subscriber(&u2).await.unwrap().unwrap();
    assert!(record.term.is_none());
    assert!(record.subscription_end.is_none());
    assert_record_invariant(&engine, &u2).await;

    let log = engine.store().transactions().await;
    assert_eq!(log.iter().filter(|e| e.message.contains("after 3 attempts")).count(), 1);
}

// ============================================================================
// Grace-period purge
// ============================================================================

#[tokio::test]
async fn test_purge_after_grace_window() {
    let engine = engine();
    let u3 = subscriber("U3");
    let four_days_ago = Utc::now() - chrono::Duration::days(4);
    engine.store().apply_activation(&u3, Term::Month, four_days_ago, None).await.unwrap();
    engine.provisioning().create("U3", four_days_ago).await.unwrap();
    engine.provisioning().creates.store(0, Ordering::SeqCst);

    let report = engine.sweep_once(Utc::now()).await;

    assert_eq!(report.purged, 1);
    assert!(engine.store().subscriber(&u3).await.unwrap().is_none());
    assert_eq!(engine.provisioning().deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_subscriber_within_grace_window_is_untouched() {
    let engine = engine();
    let u3 = subscriber("U3");
    engine
        .store()
        .apply_activation(&u3, Term::Month, Utc::now() - chrono::Duration::days(2), None)
        .await
        .unwrap();

    let report = engine.sweep_once(Utc::now()).await;

    assert_eq!(report.purged, 0);
    assert!(engine.store().subscriber(&u3).await.unwrap().is_some());
    assert_eq!(engine.provisioning().deletes.load(Ordering::SeqCst), 0);
}

//! Subscription reconciler.
//!
//! The orchestrating component: decides state transitions, drives the
//! payment and provisioning clients, records every transition attempt in
//! the transaction log, and reports outcomes to the subscriber through the
//! best-effort notifier.
//!
//! Two execution contexts share one reconciler: the request/event path
//! (purchase initiation, confirmation, webhooks, administrative actions)
//! and the background sweep of [`sweep`]. They coordinate only through the
//! store's atomic ledger operations and conditional writes; no transition
//! holds a lock across an external call.

pub mod state;
pub mod sweep;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

pub use state::SubscriptionState;
pub use sweep::SweepReport;

use crate::{
    clients::{
        payment::{IntentStatus, PaymentGateway, WebhookEnvelope},
        provisioning::ProvisioningApi,
    },
    config::RenewalPolicy,
    error::{EngineError, Result},
    notify::Notifier,
    store::{
        LedgerInsert, Store,
        models::{
            PaymentMethodToken, PendingPayment, Subscriber, SubscriberId, Term, TransactionStatus,
        },
    },
    tariff::TariffTable,
};

/// A completed activation or renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    /// Access URL of the provisioned account.
    pub access_url: String,
    /// New end of the paid period.
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a user-initiated purchase confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The payment settled and the subscription is active.
    Activated(Activation),
    /// The payment has not settled yet; state is unchanged and the caller
    /// may retry later.
    Pending,
    /// The gateway reports the payment settled unsuccessfully; the pending
    /// entry is kept so a later purchase supersedes it.
    Failed,
}

/// Outcome of an inbound gateway webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event activated a subscription.
    Activated(Activation),
    /// The event's payment was already consumed; redelivery is a no-op.
    AlreadyHandled,
    /// The event type is not one the engine acts on.
    Ignored,
}

/// The subscription reconciler.
///
/// Generic over its collaborators so tests run against in-process fakes;
/// production wires the HTTP clients and a persistent store.
#[derive(Debug)]
pub struct Reconciler<S, P, V, N> {
    store: S,
    payments: P,
    provisioning: V,
    notifier: N,
    tariffs: TariffTable,
    policy: RenewalPolicy,
}

impl<S, P, V, N> Reconciler<S, P, V, N>
where
    S: Store,
    P: PaymentGateway,
    V: ProvisioningApi,
    N: Notifier,
{
    /// Assembles a reconciler from its collaborators.
    pub fn new(
        store: S,
        payments: P,
        provisioning: V,
        notifier: N,
        tariffs: TariffTable,
        policy: RenewalPolicy,
    ) -> Self {
        Self { store, payments, provisioning, notifier, tariffs, policy }
    }

    /// Read access to the store, for operational inspection.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Read access to the payment gateway client.
    pub fn payments(&self) -> &P {
        &self.payments
    }

    /// Read access to the provisioning client.
    pub fn provisioning(&self) -> &V {
        &self.provisioning
    }

    /// Read access to the notifier.
    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Registers a subscriber on first contact.
    ///
    /// Idempotent: returns `false` without touching anything when the record
    /// already exists.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn register_subscriber(
        &self,
        id: SubscriberId,
        account_handle: Option<String>,
    ) -> Result<bool> {
        self.store.insert_subscriber(Subscriber::new(id, account_handle)).await
    }

    /// Initiates a purchase, returning the pending payment to confirm.
    ///
    /// If a pending payment already exists for the subscriber it is returned
    /// unchanged and no new intent is created: repeated "buy" taps are
    /// idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingTariff`] for unpriced terms, and
    /// propagates gateway or store failures.
    #[instrument(skip(self), fields(subscriber = %id))]
    pub async fn initiate_purchase(&self, id: &SubscriberId, term: Term) -> Result<PendingPayment> {
        if let Some(existing) = self.store.pending_for(id).await? {
            info!(payment_id = %existing.payment_id, "returning existing payment intent");
            return Ok(existing);
        }

        let amount =
            self.tariffs.price(term).ok_or(EngineError::MissingTariff(term))?;
        let intent = self
            .payments
            .create_intent(amount, id, &format!("{term} subscription for {id}"))
            .await?;

        let pending = PendingPayment {
            payment_id: intent.id,
            subscriber_id: id.clone(),
            term,
            amount,
            confirmation_url: intent.confirmation_url,
            created_at: Utc::now(),
        };

        // A concurrent initiation may have won the insert; its entry is the
        // authoritative one and our unclaimed intent simply expires unpaid.
        match self.store.insert_pending_if_absent(pending.clone()).await? {
            LedgerInsert::Inserted => Ok(pending),
            LedgerInsert::Existing(existing) => {
                warn!(
                    payment_id = %existing.payment_id,
                    abandoned = %pending.payment_id,
                    "concurrent purchase initiation; keeping first intent"
                );
                Ok(existing)
            }
        }
    }

    /// Confirms a purchase against the gateway and activates on settlement.
    ///
    /// Activation uses the term and amount captured in the ledger entry, not
    /// a live tariff lookup, to stay consistent with what was charged.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IntentNotFound`] when no pending entry matches
    /// `payment_id` for this subscriber (stale or replayed confirmation).
    #[instrument(skip(self), fields(subscriber = %id))]
    pub async fn confirm_purchase(
        &self,
        id: &SubscriberId,
        payment_id: &str,
    ) -> Result<ConfirmOutcome> {
        let pending = self
            .store
            .pending_for(id)
            .await?
            .filter(|p| p.payment_id == payment_id)
            .ok_or_else(|| EngineError::IntentNotFound(payment_id.to_owned()))?;

        let state = self.payments.intent_status(payment_id).await?;
        match state.status {
            IntentStatus::Pending => Ok(ConfirmOutcome::Pending),
            IntentStatus::Failed => {
                self.log(
                    id,
                    TransactionStatus::Error,
                    format!(
                        "payment {payment_id} of {} for {} settled unsuccessfully",
                        pending.amount, pending.term
                    ),
                )
                .await;
                Ok(ConfirmOutcome::Failed)
            }
            IntentStatus::Succeeded => {
                // The take is the idempotency barrier: exactly one
                // confirmation path consumes the entry.
                let Some(entry) = self.store.take_pending(id, payment_id).await? else {
                    return Err(EngineError::IntentNotFound(payment_id.to_owned()));
                };
                let activation =
                    self.activate_from_ledger(entry, state.payment_method).await?;
                Ok(ConfirmOutcome::Activated(activation))
            }
        }
    }

    /// Applies an inbound gateway notification.
    ///
    /// Follows the same settle path as [`confirm_purchase`], trusting the
    /// gateway's event instead of polling. Redelivery of an already-consumed
    /// event is a no-op.
    ///
    /// [`confirm_purchase`]: Self::confirm_purchase
    #[instrument(skip(self, envelope))]
    pub async fn handle_webhook(&self, envelope: WebhookEnvelope) -> Result<WebhookOutcome> {
        let Some(settled) = envelope.into_settled()? else {
            return Ok(WebhookOutcome::Ignored);
        };

        let Some(entry) = self
            .store
            .take_pending(&settled.subscriber_id, &settled.payment_id)
            .await?
        else {
            info!(
                subscriber = %settled.subscriber_id,
                payment_id = %settled.payment_id,
                "webhook for unknown or already-consumed payment; ignoring"
            );
            return Ok(WebhookOutcome::AlreadyHandled);
        };

        let activation = self.activate_from_ledger(entry, settled.payment_method).await?;
        Ok(WebhookOutcome::Activated(activation))
    }

    /// Grants or extends a subscription administratively, without payment.
    ///
    /// An active account keeps its already-paid time: the remote expiry is
    /// extended from its current value. An inactive or absent account is
    /// provisioned for `days` from now.
    ///
    /// # Errors
    ///
    /// Propagates provisioning and store failures; the failure is also
    /// recorded in the transaction log.
    #[instrument(skip(self), fields(subscriber = %id))]
    pub async fn grant_subscription(
        &self,
        id: &SubscriberId,
        term: Term,
        days: i64,
    ) -> Result<Activation> {
        let now = Utc::now();
        let record = self.store.subscriber(id).await?;
        let handle = record
            .as_ref()
            .map_or_else(|| id.as_str().to_owned(), |r| r.handle().to_owned());
        let currently_active = record.as_ref().is_some_and(|r| r.is_active(now));

        let outcome = if currently_active {
            self.provisioning.ensure_account(&handle, chrono::Duration::days(days), now).await
        } else {
            self.provisioning.activate_until(&handle, now + chrono::Duration::days(days)).await
        };
        let access_url = match outcome {
            Ok(url) => url,
            Err(error) => {
                self.log(
                    id,
                    TransactionStatus::Error,
                    format!("manual {term} grant of {days} days failed: {error}"),
                )
                .await;
                return Err(error);
            }
        };

        let expires_at = now + chrono::Duration::days(days);
        self.store.apply_activation(id, term, expires_at, None).await?;
        self.log(
            id,
            TransactionStatus::Success,
            format!("subscription {term} granted for {days} days until {expires_at}"),
        )
        .await;
        self.notify(id, &format!("Your subscription ({term}) is active!\nAccess link: {access_url}"))
            .await;

        Ok(Activation { access_url, expires_at })
    }

    /// Suspends the remote account without deleting it or touching the
    /// record.
    ///
    /// # Errors
    ///
    /// Propagates provisioning failures; the failure is also recorded in the
    /// transaction log.
    #[instrument(skip(self), fields(subscriber = %id))]
    pub async fn suspend(&self, id: &SubscriberId) -> Result<()> {
        let handle = self.handle_for(id).await?;
        if let Err(error) = self.provisioning.pause(&handle).await {
            self.log(id, TransactionStatus::Error, format!("suspension failed: {error}")).await;
            return Err(error);
        }
        self.log(id, TransactionStatus::Success, "subscription suspended".to_owned()).await;
        Ok(())
    }

    /// Resolves the remote account's access URL, `None` when no account
    /// exists.
    ///
    /// # Errors
    ///
    /// Propagates provisioning failures.
    pub async fn access_url(&self, id: &SubscriberId) -> Result<Option<String>> {
        let handle = self.handle_for(id).await?;
        Ok(self.provisioning.fetch(&handle).await?.map(|a| a.access_url))
    }

    /// Derives the lifecycle state of a subscriber under the active policy.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn subscription_state(&self, id: &SubscriberId) -> Result<SubscriptionState> {
        Ok(match self.store.subscriber(id).await? {
            Some(record) => {
                SubscriptionState::derive(&record, Utc::now(), self.policy.grace_window)
            }
            None => SubscriptionState::Unsubscribed,
        })
    }

    /// Activates a subscription from a consumed ledger entry.
    ///
    /// The external provisioning call happens before the local write; a
    /// duplicate local write is harmless while a duplicate external call is
    /// prevented by the exclusive ledger take.
    async fn activate_from_ledger(
        &self,
        entry: PendingPayment,
        method: Option<PaymentMethodToken>,
    ) -> Result<Activation> {
        let id = entry.subscriber_id.clone();
        self.log(
            &id,
            TransactionStatus::Processing,
            format!("processing {} payment {} of {}", entry.term, entry.payment_id, entry.amount),
        )
        .await;

        let period = entry.term.period().ok_or(EngineError::MissingTariff(entry.term))?;
        let expires_at = Utc::now() + period;
        let handle = self.handle_for(&id).await?;

        let access_url = match self.provisioning.activate_until(&handle, expires_at).await {
            Ok(url) => url,
            Err(error) => {
                self.log(
                    &id,
                    TransactionStatus::Error,
                    format!("activation of {} payment {} failed: {error}", entry.term, entry.payment_id),
                )
                .await;
                self.notify(&id, "Activation failed, please contact support.").await;
                return Err(error);
            }
        };

        self.store.apply_activation(&id, entry.term, expires_at, method).await?;
        self.log(
            &id,
            TransactionStatus::Success,
            format!("subscription {} activated until {expires_at}", entry.term),
        )
        .await;
        self.notify(
            &id,
            &format!("Subscription activated!\nAccess link: {access_url}"),
        )
        .await;

        Ok(Activation { access_url, expires_at })
    }

    async fn handle_for(&self, id: &SubscriberId) -> Result<String> {
        Ok(self
            .store
            .subscriber(id)
            .await?
            .map_or_else(|| id.as_str().to_owned(), |r| r.handle().to_owned()))
    }

    /// Appends to the transaction log; a log failure is itself logged and
    /// never aborts the transition being recorded.
    pub(crate) async fn log(&self, id: &SubscriberId, status: TransactionStatus, message: String) {
        let entry = crate::store::models::TransactionEntry::new(id.clone(), status, message);
        if let Err(error) = self.store.record(entry).await {
            tracing::error!(subscriber = %id, %error, "failed to append transaction log entry");
        }
    }

    /// Best-effort notification: delivery failure is logged, never raised.
    pub(crate) async fn notify(&self, id: &SubscriberId, text: &str) {
        if let Err(error) = self.notifier.send(id, text).await {
            warn!(subscriber = %id, %error, "notification delivery failed");
        }
    }
}

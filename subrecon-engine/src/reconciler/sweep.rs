//! Background renewal and cleanup sweep.
//!
//! One unending task wakes once per configured interval and runs a pass:
//! automatic renewal for lapsed subscribers holding a payment method, then
//! purge of records lapsed beyond the grace window. A pass never overlaps
//! with itself; the next one starts only after the prior pass, including
//! all of its per-subscriber retry delays, has completed. Failures are
//! isolated per subscriber: one account's bad day never aborts the rest of
//! the pass.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, instrument};

use super::Reconciler;
use crate::{
    clients::{payment::{ChargeOutcome, PaymentGateway}, provisioning::ProvisioningApi},
    error::EngineError,
    notify::Notifier,
    store::{
        Store,
        models::{Subscriber, Term, TransactionStatus},
    },
};

/// Counters from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Subscriptions renewed by a successful automatic charge.
    pub renewed: u32,
    /// Subscriptions reset after exhausting charge attempts.
    pub reset: u32,
    /// Records purged together with their remote accounts.
    pub purged: u32,
    /// Renewal candidates skipped (no price for their term).
    pub skipped: u32,
    /// Per-subscriber failures left for the next pass.
    pub failed: u32,
}

impl<S, P, V, N> Reconciler<S, P, V, N>
where
    S: Store,
    P: PaymentGateway,
    V: ProvisioningApi,
    N: Notifier,
{
    /// Runs the sweep forever at the configured interval.
    ///
    /// Intended to be spawned once per process; sequential awaiting of
    /// [`sweep_once`](Self::sweep_once) is what guarantees a single active
    /// sweep at a time.
    pub async fn run(&self) -> ! {
        let mut interval = tokio::time::interval(self.policy.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = self.sweep_once(Utc::now()).await;
            info!(
                renewed = report.renewed,
                reset = report.reset,
                purged = report.purged,
                skipped = report.skipped,
                failed = report.failed,
                "sweep pass complete"
            );
        }
    }

    /// Executes one renewal-and-purge pass against the clock value `now`.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        self.renewal_pass(now, &mut report).await;
        self.purge_pass(now, &mut report).await;
        report
    }

    async fn renewal_pass(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let candidates = match self.store.lapsed_with_method(now).await {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(error = %err, "failed to query renewal candidates");
                report.failed += 1;
                return;
            }
        };

        for subscriber in candidates {
            self.renew_subscriber(&subscriber, report).await;
        }
    }

    /// Attempts the bounded charge cycle for one lapsed subscriber.
    async fn renew_subscriber(&self, subscriber: &Subscriber, report: &mut SweepReport) {
        let id = &subscriber.id;
        let Some(term) = subscriber.term else {
            // Unreachable while the record invariant holds; skip rather than
            // guess a term to charge for.
            self.log(id, TransactionStatus::Error, "lapsed record carries no term".to_owned())
                .await;
            report.skipped += 1;
            return;
        };
        let (Some(price), Some(period)) = (self.tariffs.price(term), term.period()) else {
            self.log(
                id,
                TransactionStatus::Error,
                format!("no tariff for {term} subscriptions; automatic renewal skipped"),
            )
            .await;
            report.skipped += 1;
            return;
        };
        let Some(method) = subscriber.payment_method.clone() else {
            return;
        };

        let max = self.policy.max_attempts;
        for attempt in 1..=max {
            let outcome = self
                .payments
                .charge_stored_method(
                    &method,
                    price,
                    id,
                    &format!("automatic {term} renewal for {id}"),
                )
                .await;

            match outcome {
                Ok(ChargeOutcome::Succeeded) => {
                    self.apply_renewal_success(subscriber, term, period, price, report).await;
                    return;
                }
                Ok(ChargeOutcome::Failed(reason)) => {
                    self.log(
                        id,
                        TransactionStatus::Error,
                        format!("automatic charge of {price} failed (attempt {attempt}/{max}): {reason}"),
                    )
                    .await;
                }
                Err(err @ EngineError::Auth(_)) => {
                    // Fatal to this cycle; the next sweep retries from scratch.
                    self.log(
                        id,
                        TransactionStatus::Error,
                        format!("automatic renewal aborted: {err}"),
                    )
                    .await;
                    report.failed += 1;
                    return;
                }
                Err(err) => {
                    self.log(
                        id,
                        TransactionStatus::Error,
                        format!("automatic charge of {price} errored (attempt {attempt}/{max}): {err}"),
                    )
                    .await;
                }
            }

            if attempt < max {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        if let Err(err) = self.store.clear_subscription(id).await {
            error!(subscriber = %id, error = %err, "failed to reset exhausted subscription");
            report.failed += 1;
            return;
        }
        self.log(
            id,
            TransactionStatus::Error,
            format!("automatic renewal failed after {max} attempts; subscription reset"),
        )
        .await;
        self.notify(
            id,
            "Your subscription has ended and automatic payment failed. Please renew it manually.",
        )
        .await;
        report.reset += 1;
    }

    /// Extends the remote account and the record after a successful charge.
    ///
    /// The new period starts now, not at the old expiry: the subscriber does
    /// not pay for the gap the lapse created.
    async fn apply_renewal_success(
        &self,
        subscriber: &Subscriber,
        term: Term,
        period: chrono::Duration,
        price: Decimal,
        report: &mut SweepReport,
    ) {
        let id = &subscriber.id;
        let new_end = Utc::now() + period;

        let access_url = match self.provisioning.activate_until(subscriber.handle(), new_end).await
        {
            Ok(url) => url,
            Err(err) => {
                self.log(
                    id,
                    TransactionStatus::Error,
                    format!(
                        "charge of {price} succeeded but provisioning update failed: {err}; manual reconciliation required"
                    ),
                )
                .await;
                report.failed += 1;
                return;
            }
        };

        match self
            .store
            .apply_renewal(id, subscriber.subscription_end, term, new_end)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.log(
                    id,
                    TransactionStatus::Error,
                    format!(
                        "renewal write superseded by a concurrent update; charge of {price} may need manual reconciliation"
                    ),
                )
                .await;
                report.failed += 1;
                return;
            }
            Err(err) => {
                self.log(
                    id,
                    TransactionStatus::Error,
                    format!("charge of {price} succeeded but record update failed: {err}"),
                )
                .await;
                report.failed += 1;
                return;
            }
        }

        self.log(
            id,
            TransactionStatus::Success,
            format!("automatic renewal: {term} subscription extended until {new_end}"),
        )
        .await;
        self.notify(
            id,
            &format!("Your subscription was renewed automatically!\nAccess link: {access_url}"),
        )
        .await;
        report.renewed += 1;
    }

    /// Removes records lapsed beyond the grace window, together with their
    /// remote accounts.
    async fn purge_pass(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let cutoff = now - self.policy.grace_window;
        let candidates = match self.store.lapsed_before(cutoff).await {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(error = %err, "failed to query purge candidates");
                report.failed += 1;
                return;
            }
        };

        for subscriber in candidates {
            let id = &subscriber.id;
            if let Err(err) = self.provisioning.delete(subscriber.handle()).await {
                self.log(
                    id,
                    TransactionStatus::Error,
                    format!("purge failed, remote account not deleted: {err}"),
                )
                .await;
                report.failed += 1;
                continue;
            }
            match self.store.remove_subscriber(id).await {
                Ok(_) => {
                    self.log(
                        id,
                        TransactionStatus::Success,
                        format!(
                            "record and remote account removed {} days after expiry",
                            self.policy.grace_window.num_days()
                        ),
                    )
                    .await;
                    report.purged += 1;
                }
                Err(err) => {
                    self.log(
                        id,
                        TransactionStatus::Error,
                        format!("remote account deleted but record removal failed: {err}"),
                    )
                    .await;
                    report.failed += 1;
                }
            }
        }
    }
}

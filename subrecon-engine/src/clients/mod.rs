//! Collaborator clients: payment gateway and account provisioning.
//!
//! Both are consumed through traits so the reconciler and its tests never
//! depend on the HTTP plumbing.

pub mod payment;
pub mod provisioning;

pub use payment::{
    ChargeOutcome, HttpPaymentGateway, IntentState, IntentStatus, PaymentGateway, PaymentIntent,
    SettledPayment, WebhookEnvelope,
};
pub use provisioning::{HttpProvisioningClient, ProvisioningApi, RemoteAccount, TokenCache};

//! Subscription & billing reconciliation engine.
//!
//! Keeps three independently-failing systems in eventual agreement about
//! who has paid, for how long, and whether their provisioned account
//! reflects that: a persistent subscriber record, a payment gateway, and a
//! remote account-provisioning service.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────────┐
//! │ request/event    │      │ background sweep │
//! │ path (purchases, │      │ (renewal, purge) │
//! │ webhooks, admin) │      │                  │
//! └────────┬─────────┘      └────────┬─────────┘
//!          │                         │
//! ┌────────▼─────────────────────────▼─────────┐
//! │            Reconciler (this crate)         │
//! │  ┌───────┐ ┌────────────┐ ┌─────────────┐  │
//! │  │ Store │ │ Payment    │ │ Provisioning│  │
//! │  │       │ │ Gateway    │ │ Client      │  │
//! │  └───────┘ └────────────┘ └─────────────┘  │
//! └────────────────────────────────────────────┘
//! ```
//!
//! The reconciler guarantees:
//!
//! - at most one live payment intent per subscriber (idempotent purchase
//!   initiation),
//! - exactly one activation per settled payment (the ledger take is the
//!   idempotency barrier, so webhook redelivery is a no-op),
//! - bounded automatic renewal: a fixed number of charge attempts with a
//!   fixed delay, then a reset and a user notification,
//! - grace-period cleanup that removes the record and the remote account
//!   together, isolating per-subscriber failures.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use subrecon_engine::{
//!     Reconciler,
//!     clients::{HttpPaymentGateway, HttpProvisioningClient},
//!     config::EngineConfig,
//!     notify::NoopNotifier,
//!     store::{InMemoryStore, SubscriberId, Term},
//! };
//!
//! # async fn example() -> subrecon_engine::Result<()> {
//! let config = EngineConfig::from_toml(&std::fs::read_to_string("subrecon.toml").unwrap())?;
//! config.validate()?;
//!
//! let engine = Reconciler::new(
//!     InMemoryStore::new(),
//!     HttpPaymentGateway::from_config(&config.payment)?,
//!     HttpProvisioningClient::from_config(&config.provisioning)?,
//!     NoopNotifier,
//!     config.tariff_table(),
//!     config.renewal.policy(),
//! );
//!
//! let user = SubscriberId::new("user-1")?;
//! engine.register_subscriber(user.clone(), None).await?;
//! let pending = engine.initiate_purchase(&user, Term::Month).await?;
//! println!("confirm at {}", pending.confirmation_url);
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`reconciler`]: the state machine, operations, and background sweep
//! - [`store`]: persistence boundary and the in-memory implementation
//! - [`clients`]: payment gateway and provisioning clients
//! - [`notify`]: best-effort user notification
//! - [`tariff`]: term-to-price table
//! - [`config`]: TOML configuration with validation
//! - [`error`]: error taxonomy

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(
    async_fn_in_trait,
    reason = "collaborator traits are consumed through generics, never boxed"
)]

pub mod clients;
pub mod config;
pub mod error;
pub mod notify;
pub mod reconciler;
pub mod store;
pub mod tariff;

pub use error::{EngineError, Result};
pub use reconciler::{Activation, ConfirmOutcome, Reconciler, SubscriptionState, WebhookOutcome};

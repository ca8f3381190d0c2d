//! Tariff table mapping subscription terms to their current price.
//!
//! The reconciler only reads prices; mutation is reserved for external
//! administrative actions, so the table is interior-mutable and shareable.

use std::{collections::HashMap, sync::RwLock};

use rust_decimal::Decimal;

use crate::store::models::Term;

/// Current price per subscription term.
///
/// Manual grants have no tariff row: they are administratively priced (or
/// free) and never charged automatically.
#[derive(Debug)]
pub struct TariffTable {
    prices: RwLock<HashMap<Term, Decimal>>,
}

impl TariffTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self { prices: RwLock::new(HashMap::new()) }
    }

    /// Creates a table from `(term, price)` rows.
    #[must_use]
    pub fn from_rows<I: IntoIterator<Item = (Term, Decimal)>>(rows: I) -> Self {
        Self { prices: RwLock::new(rows.into_iter().collect()) }
    }

    /// Returns the current price for a term, if one is configured.
    #[must_use]
    pub fn price(&self, term: Term) -> Option<Decimal> {
        self.prices.read().expect("tariff lock poisoned").get(&term).copied()
    }

    /// Sets or replaces the price for a term.
    ///
    /// Administrative operation; the reconciler itself never calls this.
    pub fn set_price(&self, term: Term, price: Decimal) {
        self.prices.write().expect("tariff lock poisoned").insert(term, price);
    }
}

impl Default for TariffTable {
    /// The standard two-row tariff: 300 per month, 3650 per year.
    fn default() -> Self {
        Self::from_rows([
            (Term::Month, Decimal::from(300)),
            (Term::Year, Decimal::from(3650)),
        ])
    }
}

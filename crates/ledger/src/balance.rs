//! Balance derivation.
//!
//! A `Balance` is a materialized view over the ledger: it can always be
//! reproduced by folding the account's ordered entry history through
//! [`Balance::apply`]. There is no independent source of truth.
//!
//! ## Bucket rules (one deterministic rule per entry type)
//!
//! | entry type       | effect                                                    |
//! |------------------|-----------------------------------------------------------|
//! | charge/refund/fee| signed amount → `pending` until `available_at`, then `available` |
//! | payout/adjustment/tax | signed amount → `available` (no settlement delay)    |
//! | dispute_opened   | `reserved += amount` (hold; total falls by amount)        |
//! | dispute_won      | `reserved -= amount` (hold released)                      |
//! | dispute_lost     | `reserved -= amount; available -= amount` (hold discharged, funds gone) |
//! | voided (any)     | skipped                                                   |
//!
//! Under these rules the conservation invariant holds exactly:
//! `Σ signed_amount(posted entries) == total()` after any recompute.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marketpay_core::{AccountId, Currency, MinorUnits};

use crate::entry::{Direction, EntryType, LedgerEntry};

/// Derived balance snapshot for one (account, currency).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: AccountId,
    pub currency: Currency,
    /// Withdrawable funds, minor units. May go negative transiently under
    /// dispute losses; `total()` clamps at zero.
    pub available: i64,
    /// Funds inside the settlement window.
    pub pending: i64,
    /// Funds held for open disputes.
    pub reserved: i64,
    pub lifetime_gross: MinorUnits,
    pub lifetime_fees: i64,
    pub lifetime_net: i64,
    pub last_recalculated_at: DateTime<Utc>,
}

impl Balance {
    pub fn zero(account_id: AccountId, currency: Currency, as_of: DateTime<Utc>) -> Self {
        Self {
            account_id,
            currency,
            available: 0,
            pending: 0,
            reserved: 0,
            lifetime_gross: 0,
            lifetime_fees: 0,
            lifetime_net: 0,
            last_recalculated_at: as_of,
        }
    }

    /// Net position: `max(0, available + pending - reserved)`.
    pub fn total(&self) -> MinorUnits {
        (self.available + self.pending - self.reserved).max(0) as MinorUnits
    }

    /// Apply one entry to the running snapshot.
    ///
    /// This is the single rule table shared by full replay and the
    /// executor's incremental update, which is what makes the two provably
    /// equivalent: both paths call exactly this function in stream order.
    pub fn apply(&mut self, entry: &LedgerEntry, as_of: DateTime<Utc>) {
        if !entry.is_posted() {
            return;
        }

        let amount = entry.amount as i64;
        match entry.entry_type {
            EntryType::DisputeOpened => {
                self.reserved += amount;
            }
            EntryType::DisputeWon => {
                self.reserved -= amount;
            }
            EntryType::DisputeLost => {
                self.reserved -= amount;
                self.available -= amount;
            }
            _ => {
                let signed = match entry.direction {
                    Direction::Credit => amount,
                    Direction::Debit => -amount,
                };
                if entry.available_at > as_of {
                    self.pending += signed;
                } else {
                    self.available += signed;
                }
            }
        }

        // Lifetime counters track the earning side of the account.
        match (entry.entry_type, entry.direction) {
            (EntryType::Charge, Direction::Credit) => {
                self.lifetime_gross += entry.amount;
            }
            (EntryType::Fee, Direction::Debit) => {
                self.lifetime_fees += amount;
            }
            (EntryType::Fee, Direction::Credit) => {
                self.lifetime_fees -= amount;
            }
            _ => {}
        }
        if matches!(
            entry.entry_type,
            EntryType::Charge | EntryType::Refund | EntryType::Fee
        ) {
            self.lifetime_net += entry.signed_amount();
        }
    }

    /// Fold an ordered entry history into a fresh snapshot.
    ///
    /// `entries` must already be in stream order (effective_at, then
    /// insertion sequence); the stores guarantee that ordering. Same input
    /// always yields the same output, so concurrent self-invocation is safe.
    pub fn fold<'a>(
        account_id: AccountId,
        currency: Currency,
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
        as_of: DateTime<Utc>,
    ) -> Self {
        let mut balance = Self::zero(account_id, currency, as_of);
        for entry in entries {
            balance.apply(entry, as_of);
        }
        balance
    }
}

//! Settlement window policy and the observational sweep batch.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use marketpay_core::{AccountId, BatchId, Currency, MinorUnits};

use crate::entry::LedgerEntry;

/// How long funds stay `pending` before becoming withdrawable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPolicy {
    pub delay_days: u32,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self { delay_days: 7 }
    }
}

impl SettlementPolicy {
    pub fn immediate() -> Self {
        Self { delay_days: 0 }
    }

    /// When funds recognized at `effective_at` become available.
    pub fn available_at(&self, effective_at: DateTime<Utc>) -> DateTime<Utc> {
        effective_at + Duration::days(self.delay_days as i64)
    }
}

/// Per-account slice of one settlement batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSubtotal {
    pub account_id: AccountId,
    pub amount: i64,
    pub entry_count: u32,
}

/// Observational grouping of entries that crossed pending→available in one
/// scheduler run. Never authoritative: balances come from the fold, not from
/// batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementBatch {
    pub id: BatchId,
    pub currency: Currency,
    pub run_at: DateTime<Utc>,
    pub subtotals: Vec<AccountSubtotal>,
    pub total_amount: i64,
}

impl SettlementBatch {
    /// Group entries whose `available_at` fell inside (`window_start`,
    /// `run_at`] by account.
    pub fn from_window<'a>(
        currency: Currency,
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
        window_start: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> Self {
        let mut subtotals: Vec<AccountSubtotal> = Vec::new();
        let mut total_amount = 0i64;

        for entry in entries {
            if !entry.is_posted()
                || !entry.entry_type.settles()
                || entry.available_at <= window_start
                || entry.available_at > run_at
            {
                continue;
            }
            let signed = entry.signed_amount();
            total_amount += signed;
            match subtotals.iter_mut().find(|s| s.account_id == entry.account_id) {
                Some(sub) => {
                    sub.amount += signed;
                    sub.entry_count += 1;
                }
                None => subtotals.push(AccountSubtotal {
                    account_id: entry.account_id,
                    amount: signed,
                    entry_count: 1,
                }),
            }
        }

        Self {
            id: BatchId::new(),
            currency,
            run_at,
            subtotals,
            total_amount,
        }
    }
}

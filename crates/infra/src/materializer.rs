//! Balance materialization and reconciliation.
//!
//! The materializer rebuilds balance snapshots from the ledger, which is the
//! only source of truth. Reconciliation is just a recompute sweep: there is
//! nothing to "fix up", because a snapshot that disagrees with the fold is by
//! definition stale and gets overwritten.

use chrono::{DateTime, Utc};

use marketpay_core::{AccountId, Currency};
use marketpay_ledger::Balance;

use crate::store::{CoreStore, StoreError};

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub recomputed: u32,
    pub failed: u32,
}

/// Rebuilds balance snapshots from the ledger fold.
#[derive(Debug, Clone)]
pub struct BalanceMaterializer<S> {
    store: S,
}

impl<S: CoreStore> BalanceMaterializer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Recompute one (account, currency) snapshot from the full stream.
    ///
    /// Runs inside a transaction so the fold sees a consistent stream and the
    /// write cannot interleave with an executor commit.
    pub fn recompute(
        &self,
        account_id: AccountId,
        currency: &Currency,
        as_of: DateTime<Utc>,
    ) -> Result<Balance, StoreError> {
        self.store.transaction(|tx| {
            let entries = tx.entries(account_id, currency)?;
            let balance = Balance::fold(account_id, currency.clone(), &entries, as_of);
            tx.put_balance(balance.clone())?;
            Ok(balance)
        })
    }

    /// Recompute every known (account, currency) pair.
    ///
    /// A failure on one pair is logged and counted, never propagated; the
    /// sweep always visits every account.
    pub fn reconcile_all(&self, as_of: DateTime<Utc>) -> Result<ReconciliationReport, StoreError> {
        let pairs = self.store.account_currencies()?;
        let mut report = ReconciliationReport::default();

        for (account_id, currency) in pairs {
            match self.recompute(account_id, &currency, as_of) {
                Ok(balance) => {
                    report.recomputed += 1;
                    tracing::debug!(
                        account = %account_id,
                        currency = %currency,
                        available = balance.available,
                        pending = balance.pending,
                        reserved = balance.reserved,
                        "balance reconciled"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::error!(
                        account = %account_id,
                        currency = %currency,
                        error = %err,
                        "balance reconciliation failed"
                    );
                }
            }
        }

        tracing::info!(
            recomputed = report.recomputed,
            failed = report.failed,
            "reconciliation sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use marketpay_core::{CreatedBy, EntryId};
    use marketpay_ledger::{Direction, EntryStatus, EntryType, SourceType, UnpostedEntry};
    use serde_json::Value as JsonValue;
    use std::sync::Arc;

    fn credit(account: AccountId, amount: u64, now: DateTime<Utc>) -> UnpostedEntry {
        UnpostedEntry {
            id: EntryId::new(),
            account_id: account,
            entry_type: EntryType::Adjustment,
            direction: Direction::Credit,
            amount,
            currency: Currency::usd(),
            source_type: SourceType::Adjustment,
            source_reference: "seed".to_string(),
            status: EntryStatus::Posted,
            effective_at: now,
            available_at: now,
            created_by: CreatedBy::System,
            metadata: JsonValue::Null,
        }
    }

    #[test]
    fn recompute_overwrites_a_stale_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        let account = AccountId::new();
        let now = Utc::now();

        store
            .transaction(|tx| {
                tx.append_entry(credit(account, 7_500, now))?;
                // A snapshot that disagrees with the ledger.
                let mut stale = Balance::zero(account, Currency::usd(), now);
                stale.available = 1;
                tx.put_balance(stale)
            })
            .unwrap();

        let materializer = BalanceMaterializer::new(Arc::clone(&store));
        let balance = materializer.recompute(account, &Currency::usd(), now).unwrap();
        assert_eq!(balance.available, 7_500);
        assert_eq!(
            store.balance(account, &Currency::usd()).unwrap().unwrap(),
            balance
        );
    }

    #[test]
    fn reconcile_all_visits_every_pair() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let accounts = [AccountId::new(), AccountId::new(), AccountId::new()];

        store
            .transaction(|tx| {
                for account in accounts {
                    tx.append_entry(credit(account, 100, now))?;
                }
                Ok(())
            })
            .unwrap();

        let materializer = BalanceMaterializer::new(Arc::clone(&store));
        let report = materializer.reconcile_all(now).unwrap();
        assert_eq!(report.recomputed, 3);
        assert_eq!(report.failed, 0);

        for account in accounts {
            let balance = store.balance(account, &Currency::usd()).unwrap().unwrap();
            assert_eq!(balance.available, 100);
        }
    }
}

//! In-memory store for tests and development.
//!
//! One `RwLock` guards the whole state. A transaction takes the write lock,
//! clones the state, runs the closure against the clone, and swaps the clone
//! back only on success — all-or-nothing semantics with full isolation, the
//! same contract the Postgres store gets from real transactions.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use marketpay_billing::{Statement, StatementPeriod, Subscription};
use marketpay_core::{AccountId, Currency, PayoutId, SubscriptionId};
use marketpay_ledger::{Balance, LedgerEntry, SettlementBatch, UnpostedEntry};
use marketpay_payouts::Payout;

use crate::idempotency::{IdempotencyRecord, KeyStatus};
use crate::store::{
    CoreStore, KeyReservation, LedgerFilter, LedgerPage, Pagination, StoreError, StoreTx,
};

#[derive(Debug, Clone, Default)]
struct State {
    entries: Vec<LedgerEntry>,
    next_sequence: u64,
    balances: HashMap<(AccountId, Currency), Balance>,
    keys: HashMap<String, IdempotencyRecord>,
    payouts: HashMap<PayoutId, Payout>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    statements: HashMap<(AccountId, i32, u32, Currency), Statement>,
    batches: Vec<SettlementBatch>,
}

impl State {
    fn stream(&self, account_id: AccountId, currency: &Currency) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .entries
            .iter()
            .filter(|e| e.account_id == account_id && &e.currency == currency)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.effective_at
                .cmp(&b.effective_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        entries
    }
}

/// Lock-guarded store with transactional clone-and-swap semantics.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                next_sequence: 1,
                ..State::default()
            }),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Io("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Io("store lock poisoned".to_string()))
    }
}

/// Transaction handle over a cloned state snapshot.
struct MemTx {
    state: State,
}

impl StoreTx for MemTx {
    fn append_entry(&mut self, entry: UnpostedEntry) -> Result<LedgerEntry, StoreError> {
        entry
            .validate()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let sequence = self.state.next_sequence;
        self.state.next_sequence += 1;
        let posted = entry.into_posted(sequence);
        self.state.entries.push(posted.clone());
        Ok(posted)
    }

    fn entries(
        &mut self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.state.stream(account_id, currency))
    }

    fn entries_by_source(
        &mut self,
        account_id: AccountId,
        currency: &Currency,
        source_reference: &str,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .state
            .stream(account_id, currency)
            .into_iter()
            .filter(|e| e.source_reference == source_reference)
            .collect())
    }

    fn balance(
        &mut self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Option<Balance>, StoreError> {
        Ok(self
            .state
            .balances
            .get(&(account_id, currency.clone()))
            .cloned())
    }

    fn put_balance(&mut self, balance: Balance) -> Result<(), StoreError> {
        self.state
            .balances
            .insert((balance.account_id, balance.currency.clone()), balance);
        Ok(())
    }

    fn payout(&mut self, payout_id: PayoutId) -> Result<Option<Payout>, StoreError> {
        Ok(self.state.payouts.get(&payout_id).cloned())
    }

    fn put_payout(&mut self, payout: Payout) -> Result<(), StoreError> {
        self.state.payouts.insert(payout.id, payout);
        Ok(())
    }

    fn subscription(
        &mut self,
        subscription_id: SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.state.subscriptions.get(&subscription_id).cloned())
    }

    fn put_subscription(&mut self, subscription: Subscription) -> Result<(), StoreError> {
        self.state
            .subscriptions
            .insert(subscription.id, subscription);
        Ok(())
    }

    fn insert_statement(&mut self, statement: Statement) -> Result<(), StoreError> {
        let key = (
            statement.account_id,
            statement.period.year,
            statement.period.month,
            statement.currency.clone(),
        );
        if self.state.statements.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "statement {} already exists for account {}",
                statement.period, statement.account_id
            )));
        }
        self.state.statements.insert(key, statement);
        Ok(())
    }
}

impl CoreStore for InMemoryStore {
    fn transaction<T>(
        &self,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.write()?;
        let mut tx = MemTx {
            state: guard.clone(),
        };
        let value = f(&mut tx)?;
        *guard = tx.state;
        Ok(value)
    }

    fn query_ledger(
        &self,
        account_id: AccountId,
        currency: &Currency,
        filter: &LedgerFilter,
        pagination: Pagination,
    ) -> Result<LedgerPage, StoreError> {
        let state = self.read()?;
        let matching: Vec<LedgerEntry> = state
            .stream(account_id, currency)
            .into_iter()
            .filter(|e| {
                filter.entry_type.is_none_or(|t| e.entry_type == t)
                    && filter.status.is_none_or(|s| e.status == s)
                    && filter
                        .source_reference
                        .as_deref()
                        .is_none_or(|r| e.source_reference == r)
                    && filter.effective_after.is_none_or(|t| e.effective_at >= t)
                    && filter.effective_before.is_none_or(|t| e.effective_at < t)
            })
            .collect();

        let total = matching.len() as u64;
        let offset = pagination.offset as usize;
        let limit = pagination.limit as usize;
        let entries: Vec<LedgerEntry> = matching.into_iter().skip(offset).take(limit).collect();
        let has_more = (offset + entries.len()) < total as usize;

        Ok(LedgerPage {
            entries,
            total,
            pagination,
            has_more,
        })
    }

    fn all_entries(&self, currency: &Currency) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.read()?;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| &e.currency == currency)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.effective_at
                .cmp(&b.effective_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(entries)
    }

    fn account_currencies(&self) -> Result<Vec<(AccountId, Currency)>, StoreError> {
        let state = self.read()?;
        let mut pairs: Vec<(AccountId, Currency)> = state
            .entries
            .iter()
            .map(|e| (e.account_id, e.currency.clone()))
            .collect();
        pairs.sort_by(|a, b| {
            a.0.to_string()
                .cmp(&b.0.to_string())
                .then_with(|| a.1.as_str().cmp(b.1.as_str()))
        });
        pairs.dedup();
        Ok(pairs)
    }

    fn balance(
        &self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Option<Balance>, StoreError> {
        let state = self.read()?;
        Ok(state.balances.get(&(account_id, currency.clone())).cloned())
    }

    fn payout(&self, payout_id: PayoutId) -> Result<Option<Payout>, StoreError> {
        let state = self.read()?;
        Ok(state.payouts.get(&payout_id).cloned())
    }

    fn insert_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::Conflict(format!(
                "subscription {} already exists",
                subscription.id
            )));
        }
        state.subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    fn due_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError> {
        let state = self.read()?;
        let mut due: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_billing_at.cmp(&b.next_billing_at));
        Ok(due)
    }

    fn statement(
        &self,
        account_id: AccountId,
        period: StatementPeriod,
        currency: &Currency,
    ) -> Result<Option<Statement>, StoreError> {
        let state = self.read()?;
        Ok(state
            .statements
            .get(&(account_id, period.year, period.month, currency.clone()))
            .cloned())
    }

    fn insert_batch(&self, batch: SettlementBatch) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.batches.push(batch);
        Ok(())
    }

    fn latest_batch_run(&self, currency: &Currency) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.read()?;
        Ok(state
            .batches
            .iter()
            .filter(|b| &b.currency == currency)
            .map(|b| b.run_at)
            .max())
    }

    fn reserve_key(&self, record: IdempotencyRecord) -> Result<KeyReservation, StoreError> {
        let mut state = self.write()?;
        if let Some(existing) = state.keys.get(&record.key) {
            return Ok(KeyReservation::Existing(existing.clone()));
        }
        state.keys.insert(record.key.clone(), record);
        Ok(KeyReservation::Inserted)
    }

    fn key(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let state = self.read()?;
        Ok(state.keys.get(key).cloned())
    }

    fn update_key(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if !state.keys.contains_key(&record.key) {
            return Err(StoreError::NotFound(format!(
                "idempotency key {}",
                record.key
            )));
        }
        state.keys.insert(record.key.clone(), record);
        Ok(())
    }

    fn remove_key(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.keys.remove(key);
        Ok(())
    }

    fn claim_key(
        &self,
        key: &str,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        match state.keys.get_mut(key) {
            Some(record)
                if record.status == KeyStatus::Pending
                    && record.updated_at == expected_updated_at =>
            {
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

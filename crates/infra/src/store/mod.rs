//! Durable storage abstractions.
//!
//! The store is the sole suspension point of the core: every read and write
//! is a blocking call, and every executor operation runs inside one atomic,
//! isolated [`CoreStore::transaction`]. Two implementations exist:
//! [`InMemoryStore`] (tests/dev) and, behind the `postgres` feature,
//! `PostgresStore` (production).

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use marketpay_billing::{Statement, StatementPeriod, Subscription};
use marketpay_core::{AccountId, Currency, PayoutId, SubscriptionId};
use marketpay_ledger::{
    EntryStatus, EntryType, LedgerEntry, SettlementBatch, UnpostedEntry,
};
use marketpay_payouts::Payout;

use crate::idempotency::IdempotencyRecord;

/// Storage operation error.
///
/// These are infrastructure failures (conflicts, IO) as opposed to domain
/// errors. A `Conflict` means nothing was committed and the caller may retry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint violation or concurrent commit detected.
    #[error("storage conflict: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    /// Invalid data reached the storage layer.
    #[error("invalid record: {0}")]
    Invalid(String),

    /// Connection/serialization/IO failure; the transaction rolled back.
    #[error("storage io error: {0}")]
    Io(String),
}

/// Pagination parameters for ledger queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for ledger queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerFilter {
    pub entry_type: Option<EntryType>,
    pub status: Option<EntryStatus>,
    pub source_reference: Option<String>,
    pub effective_after: Option<DateTime<Utc>>,
    pub effective_before: Option<DateTime<Utc>>,
}

/// Paginated ledger query result, in stream order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerPage {
    pub entries: Vec<LedgerEntry>,
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

/// Outcome of the atomic reserve-by-unique-insert on the key table.
#[derive(Debug, Clone)]
pub enum KeyReservation {
    /// The record was inserted; the caller owns the reservation.
    Inserted,
    /// A record already existed; here it is, untouched.
    Existing(IdempotencyRecord),
}

/// Mutations visible inside one atomic transaction.
///
/// Everything done through a `StoreTx` commits together or not at all; a
/// failure at any step aborts the whole transaction and no partial mutation
/// survives.
pub trait StoreTx {
    /// Append one immutable entry; the store assigns the insertion sequence.
    fn append_entry(&mut self, entry: UnpostedEntry) -> Result<LedgerEntry, StoreError>;

    /// Full (account, currency) history ordered by effective_at, tie-broken
    /// by insertion sequence. Replay over this order is deterministic.
    fn entries(
        &mut self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Entries pointing at one source reference (e.g. a charge and its
    /// refunds), in stream order.
    fn entries_by_source(
        &mut self,
        account_id: AccountId,
        currency: &Currency,
        source_reference: &str,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    fn balance(
        &mut self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Option<marketpay_ledger::Balance>, StoreError>;

    fn put_balance(&mut self, balance: marketpay_ledger::Balance) -> Result<(), StoreError>;

    fn payout(&mut self, payout_id: PayoutId) -> Result<Option<Payout>, StoreError>;

    fn put_payout(&mut self, payout: Payout) -> Result<(), StoreError>;

    fn subscription(
        &mut self,
        subscription_id: SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError>;

    fn put_subscription(&mut self, subscription: Subscription) -> Result<(), StoreError>;

    /// Insert a finalized statement. Fails with `Conflict` if one already
    /// exists for (account, period, currency) — statements are never
    /// regenerated.
    fn insert_statement(&mut self, statement: Statement) -> Result<(), StoreError>;
}

/// The durable core store.
///
/// Implementations must provide atomic, isolated transactions and an atomic
/// unique insert for idempotency-key reservation — that unique insert is the
/// cross-process mutual exclusion for every money-moving operation.
pub trait CoreStore: Send + Sync {
    /// Run `f` inside one atomic transaction. If `f` returns an error the
    /// transaction rolls back and nothing is persisted.
    fn transaction<T>(
        &self,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>,
    ) -> Result<T, StoreError>;

    /// Read-only paginated ledger query (outside any transaction).
    fn query_ledger(
        &self,
        account_id: AccountId,
        currency: &Currency,
        filter: &LedgerFilter,
        pagination: Pagination,
    ) -> Result<LedgerPage, StoreError>;

    /// Every entry for a currency, in stream order (settlement batch window
    /// computation).
    fn all_entries(&self, currency: &Currency) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Distinct (account, currency) pairs that have ledger activity.
    fn account_currencies(&self) -> Result<Vec<(AccountId, Currency)>, StoreError>;

    fn balance(
        &self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Option<marketpay_ledger::Balance>, StoreError>;

    fn payout(&self, payout_id: PayoutId) -> Result<Option<Payout>, StoreError>;

    fn insert_subscription(&self, subscription: Subscription) -> Result<(), StoreError>;

    fn due_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError>;

    fn statement(
        &self,
        account_id: AccountId,
        period: StatementPeriod,
        currency: &Currency,
    ) -> Result<Option<Statement>, StoreError>;

    fn insert_batch(&self, batch: SettlementBatch) -> Result<(), StoreError>;

    /// When the most recent settlement batch for this currency ran.
    fn latest_batch_run(&self, currency: &Currency) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Atomically insert the key record if the key is unseen; otherwise
    /// return the existing record untouched.
    fn reserve_key(&self, record: IdempotencyRecord) -> Result<KeyReservation, StoreError>;

    fn key(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Overwrite an existing key record (terminal transitions).
    fn update_key(&self, record: IdempotencyRecord) -> Result<(), StoreError>;

    /// Drop a reservation so the key can be reserved again. Used when an
    /// execution failed before committing anything.
    fn remove_key(&self, key: &str) -> Result<(), StoreError>;

    /// Take over a pending reservation, compare-and-swap on `updated_at`.
    /// Returns false if the record is terminal, gone, or another claimer won.
    fn claim_key(
        &self,
        key: &str,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

impl<S> CoreStore for Arc<S>
where
    S: CoreStore + ?Sized,
{
    fn transaction<T>(
        &self,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        (**self).transaction(f)
    }

    fn query_ledger(
        &self,
        account_id: AccountId,
        currency: &Currency,
        filter: &LedgerFilter,
        pagination: Pagination,
    ) -> Result<LedgerPage, StoreError> {
        (**self).query_ledger(account_id, currency, filter, pagination)
    }

    fn all_entries(&self, currency: &Currency) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).all_entries(currency)
    }

    fn account_currencies(&self) -> Result<Vec<(AccountId, Currency)>, StoreError> {
        (**self).account_currencies()
    }

    fn balance(
        &self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Option<marketpay_ledger::Balance>, StoreError> {
        (**self).balance(account_id, currency)
    }

    fn payout(&self, payout_id: PayoutId) -> Result<Option<Payout>, StoreError> {
        (**self).payout(payout_id)
    }

    fn insert_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
        (**self).insert_subscription(subscription)
    }

    fn due_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError> {
        (**self).due_subscriptions(now)
    }

    fn statement(
        &self,
        account_id: AccountId,
        period: StatementPeriod,
        currency: &Currency,
    ) -> Result<Option<Statement>, StoreError> {
        (**self).statement(account_id, period, currency)
    }

    fn insert_batch(&self, batch: SettlementBatch) -> Result<(), StoreError> {
        (**self).insert_batch(batch)
    }

    fn latest_batch_run(&self, currency: &Currency) -> Result<Option<DateTime<Utc>>, StoreError> {
        (**self).latest_batch_run(currency)
    }

    fn reserve_key(&self, record: IdempotencyRecord) -> Result<KeyReservation, StoreError> {
        (**self).reserve_key(record)
    }

    fn key(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        (**self).key(key)
    }

    fn update_key(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        (**self).update_key(record)
    }

    fn remove_key(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove_key(key)
    }

    fn claim_key(
        &self,
        key: &str,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).claim_key(key, expected_updated_at, now)
    }
}

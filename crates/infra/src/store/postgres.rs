//! Postgres-backed store.
//!
//! The ledger table is append-only: the `sequence` column is a `BIGSERIAL`
//! assigned on insert, and nothing ever UPDATEs or DELETEs a row. Statement
//! uniqueness and idempotency-key reservation are enforced by primary keys,
//! so two processes racing on the same key resolve at the database.
//!
//! The [`CoreStore`] trait is synchronous; this implementation bridges into
//! sqlx by grabbing the ambient tokio runtime handle and blocking on each
//! query. Callers must run inside a tokio runtime.
//!
//! ## Error mapping
//!
//! | PostgreSQL error code | `StoreError` |
//! |-----------------------|--------------|
//! | `23505` (unique violation) | `Conflict` |
//! | other database errors | `Io` |

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tokio::runtime::Handle;
use uuid::Uuid;

use marketpay_billing::{Statement, StatementPeriod, Subscription};
use marketpay_core::{AccountId, Currency, PayoutId, SubscriptionId};
use marketpay_ledger::{Balance, LedgerEntry, SettlementBatch, UnpostedEntry};
use marketpay_payouts::Payout;

use crate::idempotency::{IdempotencyRecord, KeyStatus};
use crate::store::{
    CoreStore, KeyReservation, LedgerFilter, LedgerPage, Pagination, StoreError, StoreTx,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    sequence        BIGSERIAL PRIMARY KEY,
    id              UUID NOT NULL UNIQUE,
    account_id      UUID NOT NULL,
    entry_type      TEXT NOT NULL,
    direction       TEXT NOT NULL,
    amount          BIGINT NOT NULL CHECK (amount >= 0),
    currency        TEXT NOT NULL,
    source_type     TEXT NOT NULL,
    source_reference TEXT NOT NULL,
    status          TEXT NOT NULL,
    effective_at    TIMESTAMPTZ NOT NULL,
    available_at    TIMESTAMPTZ NOT NULL,
    created_by      TEXT NOT NULL,
    metadata        JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_stream
    ON ledger_entries (account_id, currency, effective_at, sequence);
CREATE INDEX IF NOT EXISTS idx_ledger_source
    ON ledger_entries (account_id, currency, source_reference);

CREATE TABLE IF NOT EXISTS balances (
    account_id           UUID NOT NULL,
    currency             TEXT NOT NULL,
    available            BIGINT NOT NULL,
    pending              BIGINT NOT NULL,
    reserved             BIGINT NOT NULL,
    lifetime_gross       BIGINT NOT NULL,
    lifetime_fees        BIGINT NOT NULL,
    lifetime_net         BIGINT NOT NULL,
    last_recalculated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (account_id, currency)
);

CREATE TABLE IF NOT EXISTS idempotency_keys (
    key          TEXT PRIMARY KEY,
    request_hash TEXT NOT NULL,
    status       TEXT NOT NULL,
    record       JSONB NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS payouts (
    id         UUID PRIMARY KEY,
    account_id UUID NOT NULL,
    status     TEXT NOT NULL,
    record     JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id              UUID PRIMARY KEY,
    status          TEXT NOT NULL,
    next_billing_at TIMESTAMPTZ NOT NULL,
    record          JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS statements (
    account_id UUID NOT NULL,
    year       INT NOT NULL,
    month      INT NOT NULL,
    currency   TEXT NOT NULL,
    record     JSONB NOT NULL,
    PRIMARY KEY (account_id, year, month, currency)
);

CREATE TABLE IF NOT EXISTS settlement_batches (
    id       UUID PRIMARY KEY,
    currency TEXT NOT NULL,
    run_at   TIMESTAMPTZ NOT NULL,
    record   JSONB NOT NULL
);
"#;

/// Postgres implementation of [`CoreStore`].
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the schema if it does not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        sqlx::raw_sql(SCHEMA)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

fn runtime() -> Result<Handle, StoreError> {
    Handle::try_current()
        .map_err(|_| StoreError::Io("postgres store requires a tokio runtime".to_string()))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Io(msg),
            }
        }
        other => StoreError::Io(format!("sqlx error in {operation}: {other}")),
    }
}

fn enum_to_str<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value) {
        Ok(JsonValue::String(s)) => Ok(s),
        Ok(other) => Err(StoreError::Invalid(format!(
            "expected string-serialized enum, got {other}"
        ))),
        Err(e) => Err(StoreError::Invalid(e.to_string())),
    }
}

fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_value(JsonValue::String(s.to_string()))
        .map_err(|e| StoreError::Invalid(format!("bad enum value {s:?}: {e}")))
}

fn record_from_json<T: DeserializeOwned>(value: JsonValue) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn record_to_json<T: Serialize>(value: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Invalid(e.to_string()))
}

#[derive(FromRow)]
struct EntryRow {
    sequence: i64,
    id: Uuid,
    account_id: Uuid,
    entry_type: String,
    direction: String,
    amount: i64,
    currency: String,
    source_type: String,
    source_reference: String,
    status: String,
    effective_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    created_by: String,
    metadata: JsonValue,
}

impl EntryRow {
    fn into_entry(self) -> Result<LedgerEntry, StoreError> {
        Ok(LedgerEntry {
            id: self.id.into(),
            account_id: self.account_id.into(),
            entry_type: enum_from_str(&self.entry_type)?,
            direction: enum_from_str(&self.direction)?,
            amount: self.amount as u64,
            currency: Currency::new(&self.currency)
                .map_err(|e| StoreError::Invalid(e.to_string()))?,
            source_type: enum_from_str(&self.source_type)?,
            source_reference: self.source_reference,
            status: enum_from_str(&self.status)?,
            effective_at: self.effective_at,
            available_at: self.available_at,
            created_by: enum_from_str(&self.created_by)?,
            metadata: self.metadata,
            sequence: self.sequence as u64,
        })
    }
}

#[derive(FromRow)]
struct BalanceRow {
    account_id: Uuid,
    currency: String,
    available: i64,
    pending: i64,
    reserved: i64,
    lifetime_gross: i64,
    lifetime_fees: i64,
    lifetime_net: i64,
    last_recalculated_at: DateTime<Utc>,
}

impl BalanceRow {
    fn into_balance(self) -> Result<Balance, StoreError> {
        Ok(Balance {
            account_id: self.account_id.into(),
            currency: Currency::new(&self.currency)
                .map_err(|e| StoreError::Invalid(e.to_string()))?,
            available: self.available,
            pending: self.pending,
            reserved: self.reserved,
            lifetime_gross: self.lifetime_gross as u64,
            lifetime_fees: self.lifetime_fees,
            lifetime_net: self.lifetime_net,
            last_recalculated_at: self.last_recalculated_at,
        })
    }
}

const ENTRY_COLUMNS: &str = "sequence, id, account_id, entry_type, direction, amount, currency, \
     source_type, source_reference, status, effective_at, available_at, created_by, metadata";

async fn stream_query<'e, E>(
    executor: E,
    account_id: AccountId,
    currency: &Currency,
) -> Result<Vec<LedgerEntry>, StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let rows: Vec<EntryRow> = sqlx::query_as(&format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
         WHERE account_id = $1 AND currency = $2 \
         ORDER BY effective_at ASC, sequence ASC"
    ))
    .bind(account_id.as_uuid())
    .bind(currency.as_str())
    .fetch_all(executor)
    .await
    .map_err(|e| map_sqlx_error("stream", e))?;

    rows.into_iter().map(EntryRow::into_entry).collect()
}

async fn insert_entry(
    tx: &mut Transaction<'static, Postgres>,
    entry: &UnpostedEntry,
) -> Result<u64, StoreError> {
    let row = sqlx::query(
        "INSERT INTO ledger_entries \
         (id, account_id, entry_type, direction, amount, currency, source_type, \
          source_reference, status, effective_at, available_at, created_by, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING sequence",
    )
    .bind(entry.id.as_uuid())
    .bind(entry.account_id.as_uuid())
    .bind(enum_to_str(&entry.entry_type)?)
    .bind(enum_to_str(&entry.direction)?)
    .bind(entry.amount as i64)
    .bind(entry.currency.as_str())
    .bind(enum_to_str(&entry.source_type)?)
    .bind(&entry.source_reference)
    .bind(enum_to_str(&entry.status)?)
    .bind(entry.effective_at)
    .bind(entry.available_at)
    .bind(enum_to_str(&entry.created_by)?)
    .bind(&entry.metadata)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("append_entry", e))?;

    let sequence: i64 = row
        .try_get("sequence")
        .map_err(|e| map_sqlx_error("append_entry", e))?;
    Ok(sequence as u64)
}

/// Transaction handle bridging the sync [`StoreTx`] surface onto sqlx.
struct PgTx {
    tx: Option<Transaction<'static, Postgres>>,
    handle: Handle,
}

impl PgTx {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Io("transaction already closed".to_string()))
    }
}

impl StoreTx for PgTx {
    fn append_entry(&mut self, entry: UnpostedEntry) -> Result<LedgerEntry, StoreError> {
        entry
            .validate()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let handle = self.handle.clone();
        let tx = self.tx()?;
        let sequence = handle.block_on(insert_entry(tx, &entry))?;
        Ok(entry.into_posted(sequence))
    }

    fn entries(
        &mut self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let handle = self.handle.clone();
        let tx = self.tx()?;
        handle.block_on(stream_query(&mut **tx, account_id, currency))
    }

    fn entries_by_source(
        &mut self,
        account_id: AccountId,
        currency: &Currency,
        source_reference: &str,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let handle = self.handle.clone();
        let tx = self.tx()?;
        handle.block_on(async {
            let rows: Vec<EntryRow> = sqlx::query_as(&format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
                 WHERE account_id = $1 AND currency = $2 AND source_reference = $3 \
                 ORDER BY effective_at ASC, sequence ASC"
            ))
            .bind(account_id.as_uuid())
            .bind(currency.as_str())
            .bind(source_reference)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("entries_by_source", e))?;
            rows.into_iter().map(EntryRow::into_entry).collect()
        })
    }

    fn balance(
        &mut self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Option<Balance>, StoreError> {
        let handle = self.handle.clone();
        let tx = self.tx()?;
        handle.block_on(async {
            let row: Option<BalanceRow> = sqlx::query_as(
                "SELECT account_id, currency, available, pending, reserved, lifetime_gross, \
                 lifetime_fees, lifetime_net, last_recalculated_at \
                 FROM balances WHERE account_id = $1 AND currency = $2",
            )
            .bind(account_id.as_uuid())
            .bind(currency.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("balance", e))?;
            row.map(BalanceRow::into_balance).transpose()
        })
    }

    fn put_balance(&mut self, balance: Balance) -> Result<(), StoreError> {
        let handle = self.handle.clone();
        let tx = self.tx()?;
        handle.block_on(async {
            sqlx::query(
                "INSERT INTO balances \
                 (account_id, currency, available, pending, reserved, lifetime_gross, \
                  lifetime_fees, lifetime_net, last_recalculated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (account_id, currency) DO UPDATE SET \
                   available = EXCLUDED.available, \
                   pending = EXCLUDED.pending, \
                   reserved = EXCLUDED.reserved, \
                   lifetime_gross = EXCLUDED.lifetime_gross, \
                   lifetime_fees = EXCLUDED.lifetime_fees, \
                   lifetime_net = EXCLUDED.lifetime_net, \
                   last_recalculated_at = EXCLUDED.last_recalculated_at",
            )
            .bind(balance.account_id.as_uuid())
            .bind(balance.currency.as_str())
            .bind(balance.available)
            .bind(balance.pending)
            .bind(balance.reserved)
            .bind(balance.lifetime_gross as i64)
            .bind(balance.lifetime_fees)
            .bind(balance.lifetime_net)
            .bind(balance.last_recalculated_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("put_balance", e))?;
            Ok(())
        })
    }

    fn payout(&mut self, payout_id: PayoutId) -> Result<Option<Payout>, StoreError> {
        let handle = self.handle.clone();
        let tx = self.tx()?;
        handle.block_on(async {
            let record: Option<JsonValue> =
                sqlx::query_scalar("SELECT record FROM payouts WHERE id = $1")
                    .bind(payout_id.as_uuid())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| map_sqlx_error("payout", e))?;
            record.map(record_from_json).transpose()
        })
    }

    fn put_payout(&mut self, payout: Payout) -> Result<(), StoreError> {
        let handle = self.handle.clone();
        let tx = self.tx()?;
        handle.block_on(async {
            sqlx::query(
                "INSERT INTO payouts (id, account_id, status, record) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, record = EXCLUDED.record",
            )
            .bind(payout.id.as_uuid())
            .bind(payout.account_id.as_uuid())
            .bind(enum_to_str(&payout.status)?)
            .bind(record_to_json(&payout)?)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("put_payout", e))?;
            Ok(())
        })
    }

    fn subscription(
        &mut self,
        subscription_id: SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError> {
        let handle = self.handle.clone();
        let tx = self.tx()?;
        handle.block_on(async {
            let record: Option<JsonValue> =
                sqlx::query_scalar("SELECT record FROM subscriptions WHERE id = $1")
                    .bind(subscription_id.as_uuid())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| map_sqlx_error("subscription", e))?;
            record.map(record_from_json).transpose()
        })
    }

    fn put_subscription(&mut self, subscription: Subscription) -> Result<(), StoreError> {
        let handle = self.handle.clone();
        let tx = self.tx()?;
        handle.block_on(async {
            sqlx::query(
                "INSERT INTO subscriptions (id, status, next_billing_at, record) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (id) DO UPDATE SET \
                   status = EXCLUDED.status, \
                   next_billing_at = EXCLUDED.next_billing_at, \
                   record = EXCLUDED.record",
            )
            .bind(subscription.id.as_uuid())
            .bind(enum_to_str(&subscription.status)?)
            .bind(subscription.next_billing_at)
            .bind(record_to_json(&subscription)?)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("put_subscription", e))?;
            Ok(())
        })
    }

    fn insert_statement(&mut self, statement: Statement) -> Result<(), StoreError> {
        let handle = self.handle.clone();
        let tx = self.tx()?;
        handle.block_on(async {
            sqlx::query(
                "INSERT INTO statements (account_id, year, month, currency, record) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(statement.account_id.as_uuid())
            .bind(statement.period.year)
            .bind(statement.period.month as i32)
            .bind(statement.currency.as_str())
            .bind(record_to_json(&statement)?)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_statement", e))?;
            Ok(())
        })
    }
}

impl CoreStore for PostgresStore {
    fn transaction<T>(
        &self,
        f: impl FnOnce(&mut dyn StoreTx) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let handle = runtime()?;
        let pool = Arc::clone(&self.pool);
        let tx = handle
            .block_on(pool.begin())
            .map_err(|e| map_sqlx_error("begin", e))?;

        let mut pg_tx = PgTx {
            tx: Some(tx),
            handle: handle.clone(),
        };

        match f(&mut pg_tx) {
            Ok(value) => {
                let tx = pg_tx
                    .tx
                    .take()
                    .ok_or_else(|| StoreError::Io("transaction vanished".to_string()))?;
                handle
                    .block_on(tx.commit())
                    .map_err(|e| map_sqlx_error("commit", e))?;
                Ok(value)
            }
            Err(err) => {
                if let Some(tx) = pg_tx.tx.take() {
                    let _ = handle.block_on(tx.rollback());
                }
                Err(err)
            }
        }
    }

    fn query_ledger(
        &self,
        account_id: AccountId,
        currency: &Currency,
        filter: &LedgerFilter,
        pagination: Pagination,
    ) -> Result<LedgerPage, StoreError> {
        let handle = runtime()?;
        let entries = handle.block_on(stream_query(&*self.pool, account_id, currency))?;

        let matching: Vec<LedgerEntry> = entries
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
        let page: Vec<LedgerEntry> = matching.into_iter().skip(offset).take(limit).collect();
        let has_more = (offset + page.len()) < total as usize;

        Ok(LedgerPage {
            entries: page,
            total,
            pagination,
            has_more,
        })
    }

    fn all_entries(&self, currency: &Currency) -> Result<Vec<LedgerEntry>, StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let rows: Vec<EntryRow> = sqlx::query_as(&format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE currency = $1 \
                 ORDER BY effective_at ASC, sequence ASC"
            ))
            .bind(currency.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("all_entries", e))?;
            rows.into_iter().map(EntryRow::into_entry).collect()
        })
    }

    fn account_currencies(&self) -> Result<Vec<(AccountId, Currency)>, StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let rows: Vec<(Uuid, String)> = sqlx::query_as(
                "SELECT DISTINCT account_id, currency FROM ledger_entries \
                 ORDER BY account_id, currency",
            )
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("account_currencies", e))?;
            rows.into_iter()
                .map(|(account, code)| {
                    Currency::new(&code)
                        .map(|currency| (AccountId::from(account), currency))
                        .map_err(|e| StoreError::Invalid(e.to_string()))
                })
                .collect()
        })
    }

    fn balance(
        &self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Option<Balance>, StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let row: Option<BalanceRow> = sqlx::query_as(
                "SELECT account_id, currency, available, pending, reserved, lifetime_gross, \
                 lifetime_fees, lifetime_net, last_recalculated_at \
                 FROM balances WHERE account_id = $1 AND currency = $2",
            )
            .bind(account_id.as_uuid())
            .bind(currency.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("balance", e))?;
            row.map(BalanceRow::into_balance).transpose()
        })
    }

    fn payout(&self, payout_id: PayoutId) -> Result<Option<Payout>, StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let record: Option<JsonValue> =
                sqlx::query_scalar("SELECT record FROM payouts WHERE id = $1")
                    .bind(payout_id.as_uuid())
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("payout", e))?;
            record.map(record_from_json).transpose()
        })
    }

    fn insert_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            sqlx::query(
                "INSERT INTO subscriptions (id, status, next_billing_at, record) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(subscription.id.as_uuid())
            .bind(enum_to_str(&subscription.status)?)
            .bind(subscription.next_billing_at)
            .bind(record_to_json(&subscription)?)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_subscription", e))?;
            Ok(())
        })
    }

    fn due_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let records: Vec<JsonValue> = sqlx::query_scalar(
                "SELECT record FROM subscriptions \
                 WHERE next_billing_at <= $1 AND status <> 'canceled' \
                 ORDER BY next_billing_at ASC",
            )
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("due_subscriptions", e))?;
            records
                .into_iter()
                .map(record_from_json::<Subscription>)
                .collect()
        })
    }

    fn statement(
        &self,
        account_id: AccountId,
        period: StatementPeriod,
        currency: &Currency,
    ) -> Result<Option<Statement>, StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let record: Option<JsonValue> = sqlx::query_scalar(
                "SELECT record FROM statements \
                 WHERE account_id = $1 AND year = $2 AND month = $3 AND currency = $4",
            )
            .bind(account_id.as_uuid())
            .bind(period.year)
            .bind(period.month as i32)
            .bind(currency.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("statement", e))?;
            record.map(record_from_json).transpose()
        })
    }

    fn insert_batch(&self, batch: SettlementBatch) -> Result<(), StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            sqlx::query(
                "INSERT INTO settlement_batches (id, currency, run_at, record) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(batch.id.as_uuid())
            .bind(batch.currency.as_str())
            .bind(batch.run_at)
            .bind(record_to_json(&batch)?)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_batch", e))?;
            Ok(())
        })
    }

    fn latest_batch_run(&self, currency: &Currency) -> Result<Option<DateTime<Utc>>, StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let run_at: Option<DateTime<Utc>> = sqlx::query_scalar(
                "SELECT MAX(run_at) FROM settlement_batches WHERE currency = $1",
            )
            .bind(currency.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_batch_run", e))?;
            Ok(run_at)
        })
    }

    fn reserve_key(&self, record: IdempotencyRecord) -> Result<KeyReservation, StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let inserted = sqlx::query(
                "INSERT INTO idempotency_keys \
                 (key, request_hash, status, record, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(&record.key)
            .bind(&record.request_hash)
            .bind(enum_to_str(&record.status)?)
            .bind(record_to_json(&record)?)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reserve_key", e))?
            .rows_affected();

            if inserted == 1 {
                return Ok(KeyReservation::Inserted);
            }

            let existing: JsonValue =
                sqlx::query_scalar("SELECT record FROM idempotency_keys WHERE key = $1")
                    .bind(&record.key)
                    .fetch_one(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("reserve_key", e))?;
            Ok(KeyReservation::Existing(record_from_json(existing)?))
        })
    }

    fn key(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let record: Option<JsonValue> =
                sqlx::query_scalar("SELECT record FROM idempotency_keys WHERE key = $1")
                    .bind(key)
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("key", e))?;
            record.map(record_from_json).transpose()
        })
    }

    fn update_key(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let updated = sqlx::query(
                "UPDATE idempotency_keys \
                 SET status = $2, record = $3, updated_at = $4 WHERE key = $1",
            )
            .bind(&record.key)
            .bind(enum_to_str(&record.status)?)
            .bind(record_to_json(&record)?)
            .bind(record.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_key", e))?
            .rows_affected();

            if updated == 0 {
                return Err(StoreError::NotFound(format!(
                    "idempotency key {}",
                    record.key
                )));
            }
            Ok(())
        })
    }

    fn remove_key(&self, key: &str) -> Result<(), StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            sqlx::query("DELETE FROM idempotency_keys WHERE key = $1")
                .bind(key)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("remove_key", e))?;
            Ok(())
        })
    }

    fn claim_key(
        &self,
        key: &str,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let handle = runtime()?;
        handle.block_on(async {
            let existing: Option<JsonValue> =
                sqlx::query_scalar("SELECT record FROM idempotency_keys WHERE key = $1")
                    .bind(key)
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("claim_key", e))?;
            let Some(existing) = existing else {
                return Ok(false);
            };
            let mut record = record_from_json(existing)?;
            if record.status != KeyStatus::Pending || record.updated_at != expected_updated_at {
                return Ok(false);
            }
            record.updated_at = now;

            // The WHERE clause re-checks status and timestamp, so of any
            // number of racing claimers exactly one sees rows_affected == 1.
            let claimed = sqlx::query(
                "UPDATE idempotency_keys \
                 SET record = $2, updated_at = $3 \
                 WHERE key = $1 AND status = $4 AND updated_at = $5",
            )
            .bind(key)
            .bind(record_to_json(&record)?)
            .bind(now)
            .bind(enum_to_str(&KeyStatus::Pending)?)
            .bind(expected_updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_key", e))?
            .rows_affected();
            Ok(claimed == 1)
        })
    }
}

//! Service facade.
//!
//! `PaymentsCore` wires the idempotency coordinator, the executor, and the
//! materializer together behind one entry point. Callers never touch the
//! executor directly; every operation goes through the reserve / execute /
//! record protocol here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use marketpay_billing::Subscription;
use marketpay_core::{AccountId, CreatedBy, Currency, MinorUnits};
use marketpay_ledger::{EntryType, LedgerEntry};

use crate::executor::{OpError, OperationExecutor, OperationRequest};
use crate::idempotency::{CorrelationIds, IdempotencyCoordinator, KeyError, Reservation, ResultRefs};
use crate::materializer::{BalanceMaterializer, ReconciliationReport};
use crate::processor::PaymentProcessor;
use crate::store::{CoreStore, LedgerFilter, LedgerPage, Pagination, StoreError};

/// How many times a conflicted execution is retried transparently before the
/// failure is surfaced.
const CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Operation(#[from] OpError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to a keyed request.
#[derive(Debug, Clone)]
pub enum OperationOutcome {
    /// Executed now, for the first time.
    Fresh(ResultRefs),
    /// Same key and payload seen before; this is the recorded result.
    Replayed(ResultRefs),
    /// Another holder of the key has not finished yet.
    InProgress,
    /// The key failed before; the recorded error, no re-execution.
    FailedBefore { error: String },
}

/// Caller-facing balance snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    pub available: i64,
    pub pending: i64,
    pub reserved: i64,
    pub total: MinorUnits,
    pub lifetime_gross: MinorUnits,
    pub last_recalculated_at: DateTime<Utc>,
}

/// The money-movement core: one facade over store, coordinator, executor and
/// materializer.
pub struct PaymentsCore<S, P> {
    store: S,
    coordinator: IdempotencyCoordinator<S>,
    executor: OperationExecutor<S, P>,
    materializer: BalanceMaterializer<S>,
}

impl<S, P> PaymentsCore<S, P>
where
    S: CoreStore + Clone,
    P: PaymentProcessor,
{
    pub fn new(store: S, processor: P) -> Self {
        Self {
            coordinator: IdempotencyCoordinator::new(store.clone()),
            executor: OperationExecutor::new(store.clone(), processor),
            materializer: BalanceMaterializer::new(store.clone()),
            store,
        }
    }

    /// Replace the default executor (custom fee/settlement/withholding
    /// policies).
    pub fn with_executor(mut self, executor: OperationExecutor<S, P>) -> Self {
        self.executor = executor;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn coordinator(&self) -> &IdempotencyCoordinator<S> {
        &self.coordinator
    }

    pub fn materializer(&self) -> &BalanceMaterializer<S> {
        &self.materializer
    }

    /// Submit one money-moving operation under an idempotency key.
    ///
    /// Exactly-once per key: replays return the recorded result, payload
    /// mismatches are rejected, and a commit-race loser retries transparently
    /// up to [`CONFLICT_RETRIES`] times before giving up.
    pub fn request_operation(
        &self,
        request: &OperationRequest,
        idempotency_key: &str,
        created_by: CreatedBy,
    ) -> Result<OperationOutcome, CoreError> {
        self.request_operation_at(request, idempotency_key, created_by, Utc::now())
    }

    /// [`request_operation`](Self::request_operation) with an explicit clock.
    ///
    /// `now` is the operation's effective time end to end: the reservation
    /// timestamps, the balance fold the executor validates against, and the
    /// entries it posts all use it. Scheduler drivers pass their tick time so
    /// a run and its settlement-window checks agree on what "now" is.
    pub fn request_operation_at(
        &self,
        request: &OperationRequest,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
    ) -> Result<OperationOutcome, CoreError> {
        let correlation = CorrelationIds {
            account_id: request.account_id(),
            customer_id: request.customer_id(),
        };

        let reservation = self.coordinator.reserve(
            idempotency_key,
            request.op_type(),
            &request.payload(),
            correlation,
            now,
        )?;

        match reservation {
            Reservation::Replayed(refs) => {
                tracing::debug!(key = idempotency_key, "replaying recorded result");
                Ok(OperationOutcome::Replayed(refs))
            }
            Reservation::StillInProgress => Ok(OperationOutcome::InProgress),
            Reservation::FailedBefore { error } => Ok(OperationOutcome::FailedBefore { error }),
            Reservation::Fresh => self.execute_fresh(request, idempotency_key, created_by, now),
            Reservation::Abandoned => {
                self.recover_abandoned(request, idempotency_key, created_by, now)
            }
        }
    }

    /// Finish what a dead key holder started.
    ///
    /// The executor stamps the key into every entry it posts, so if the
    /// previous holder crashed after committing, the entries are findable and
    /// the key can be completed from them. If nothing was committed, the
    /// operation simply runs.
    fn recover_abandoned(
        &self,
        request: &OperationRequest,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
    ) -> Result<OperationOutcome, CoreError> {
        let account_id = request.account_id();
        let currency = request.currency().clone();
        let history = self
            .store
            .transaction(|tx| tx.entries(account_id, &currency))?;
        let committed: Vec<&LedgerEntry> = history
            .iter()
            .filter(|e| {
                e.metadata.get("idempotency_key").and_then(|v| v.as_str())
                    == Some(idempotency_key)
            })
            .collect();

        if committed.is_empty() {
            tracing::warn!(
                key = idempotency_key,
                "abandoned reservation left nothing committed, executing"
            );
            return self.execute_fresh(request, idempotency_key, created_by, now);
        }

        let refs = ResultRefs {
            ledger_entry_ids: committed.iter().map(|e| e.id).collect(),
            payout_id: committed
                .iter()
                .find(|e| e.entry_type == EntryType::Payout)
                .and_then(|e| e.source_reference.parse().ok()),
            statement: None,
            external_id: committed
                .iter()
                .find_map(|e| e.metadata.get("external_id").and_then(|v| v.as_str()))
                .map(str::to_string),
        };
        tracing::warn!(
            key = idempotency_key,
            entries = refs.ledger_entry_ids.len(),
            "abandoned reservation had committed, completing from the ledger"
        );
        self.coordinator.complete(idempotency_key, refs.clone(), now)?;
        Ok(OperationOutcome::Replayed(refs))
    }

    fn execute_fresh(
        &self,
        request: &OperationRequest,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
    ) -> Result<OperationOutcome, CoreError> {
        let mut attempt = 0;
        let result = loop {
            match self.executor.execute(request, idempotency_key, created_by, now) {
                Err(OpError::ConcurrentConflict(msg)) if attempt + 1 < CONFLICT_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        key = idempotency_key,
                        attempt,
                        conflict = %msg,
                        "commit race lost, retrying"
                    );
                }
                other => break other,
            }
        };

        match result {
            Ok(refs) => {
                self.coordinator
                    .complete(idempotency_key, refs.clone(), now)?;
                Ok(OperationOutcome::Fresh(refs))
            }
            // Nothing committed and the condition is transient: give the key
            // back so the caller can retry with it once the store recovers.
            Err(err) if err.is_transient() => {
                if let Err(release_err) = self.coordinator.release(idempotency_key) {
                    tracing::error!(
                        key = idempotency_key,
                        error = %release_err,
                        "could not release reservation after transient failure"
                    );
                }
                Err(err.into())
            }
            Err(err) => {
                self.coordinator
                    .fail(idempotency_key, err.to_string(), now)?;
                Err(err.into())
            }
        }
    }

    /// Current materialized snapshot, if the pair has any history.
    pub fn get_balance(
        &self,
        account_id: AccountId,
        currency: &Currency,
    ) -> Result<Option<BalanceView>, CoreError> {
        Ok(self.store.balance(account_id, currency)?.map(|b| BalanceView {
            available: b.available,
            pending: b.pending,
            reserved: b.reserved,
            total: b.total(),
            lifetime_gross: b.lifetime_gross,
            last_recalculated_at: b.last_recalculated_at,
        }))
    }

    /// Paginated, filtered view of an account's ledger stream.
    pub fn get_ledger(
        &self,
        account_id: AccountId,
        currency: &Currency,
        filter: &LedgerFilter,
        pagination: Pagination,
    ) -> Result<LedgerPage, CoreError> {
        Ok(self
            .store
            .query_ledger(account_id, currency, filter, pagination)?)
    }

    /// Force a recompute sweep, either for one account or for everything.
    pub fn trigger_reconciliation(
        &self,
        account_id: Option<AccountId>,
    ) -> Result<ReconciliationReport, CoreError> {
        let as_of = Utc::now();
        match account_id {
            None => Ok(self.materializer.reconcile_all(as_of)?),
            Some(account_id) => {
                let mut report = ReconciliationReport::default();
                for (candidate, currency) in self.store.account_currencies()? {
                    if candidate != account_id {
                        continue;
                    }
                    match self.materializer.recompute(account_id, &currency, as_of) {
                        Ok(_) => report.recomputed += 1,
                        Err(err) => {
                            report.failed += 1;
                            tracing::error!(
                                account = %account_id,
                                currency = %currency,
                                error = %err,
                                "targeted reconciliation failed"
                            );
                        }
                    }
                }
                Ok(report)
            }
        }
    }

    /// Register a recurring billing agreement for the scheduler to drive.
    pub fn create_subscription(&self, subscription: Subscription) -> Result<(), CoreError> {
        Ok(self.store.insert_subscription(subscription)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{MockMode, MockProcessor};
    use crate::store::InMemoryStore;
    use marketpay_ledger::SourceType;
    use std::sync::Arc;

    fn core(mode: MockMode) -> PaymentsCore<Arc<InMemoryStore>, Arc<MockProcessor>> {
        PaymentsCore::new(Arc::new(InMemoryStore::new()), Arc::new(MockProcessor::new(mode)))
    }

    fn charge(account: AccountId, gross: MinorUnits, reference: &str) -> OperationRequest {
        OperationRequest::SettleCharge {
            account_id: account,
            currency: Currency::usd(),
            gross,
            source_type: SourceType::Order,
            source_reference: reference.to_string(),
            customer_id: None,
        }
    }

    #[test]
    fn duplicate_key_replays_without_double_posting() {
        let core = core(MockMode::Succeed);
        let account = AccountId::new();
        let request = charge(account, 10_000, "order-1");

        let first = core
            .request_operation(&request, "k1", CreatedBy::Api)
            .unwrap();
        let second = core
            .request_operation(&request, "k1", CreatedBy::Api)
            .unwrap();

        let (fresh, replayed) = match (first, second) {
            (OperationOutcome::Fresh(a), OperationOutcome::Replayed(b)) => (a, b),
            other => panic!("expected fresh then replay, got {other:?}"),
        };
        assert_eq!(fresh, replayed);

        // Exactly one charge landed.
        let balance = core.get_balance(account, &Currency::usd()).unwrap().unwrap();
        assert_eq!(balance.lifetime_gross, 10_000);
    }

    #[test]
    fn same_key_different_payload_is_rejected() {
        let core = core(MockMode::Succeed);
        let account = AccountId::new();

        core.request_operation(&charge(account, 10_000, "order-1"), "k1", CreatedBy::Api)
            .unwrap();
        let err = core
            .request_operation(&charge(account, 9_999, "order-1"), "k1", CreatedBy::Api)
            .unwrap_err();
        assert!(matches!(err, CoreError::Key(KeyError::KeyReuse)));
    }

    #[test]
    fn failed_operation_is_recorded_and_replayed_as_failure() {
        let core = core(MockMode::Decline);
        let account = AccountId::new();
        let request = charge(account, 10_000, "order-1");

        let err = core
            .request_operation(&request, "k1", CreatedBy::Api)
            .unwrap_err();
        assert!(matches!(err, CoreError::Operation(OpError::Processor(_))));

        // The retry surfaces the recorded failure without calling out again.
        match core.request_operation(&request, "k1", CreatedBy::Api).unwrap() {
            OperationOutcome::FailedBefore { error } => {
                assert!(error.contains("declined"));
            }
            other => panic!("expected failed-before, got {other:?}"),
        }
    }

    #[test]
    fn operations_execute_at_the_requested_timestamp() {
        let core = core(MockMode::Succeed);
        let account = AccountId::new();
        let t0 = Utc::now();

        core.request_operation_at(&charge(account, 10_000, "order-1"), "c1", CreatedBy::Api, t0)
            .unwrap();

        // The payout is requested for a time past the settlement window even
        // though the wall clock is still inside it; the executor must
        // validate against the requested time, not the wall clock.
        let later = t0 + chrono::Duration::days(8);
        let outcome = core
            .request_operation_at(
                &OperationRequest::Payout {
                    account_id: account,
                    currency: Currency::usd(),
                    amount: 9_580,
                },
                "p1",
                CreatedBy::Cron,
                later,
            )
            .unwrap();
        assert!(matches!(outcome, OperationOutcome::Fresh(_)));

        let balance = core.get_balance(account, &Currency::usd()).unwrap().unwrap();
        assert_eq!(balance.available, 0);
        assert_eq!(balance.last_recalculated_at, later);
    }

    /// Delegates to an [`InMemoryStore`], failing every transaction while the
    /// outage flag is up.
    #[derive(Clone)]
    struct FlakyStore {
        inner: Arc<InMemoryStore>,
        down: Arc<std::sync::atomic::AtomicBool>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: Arc::new(InMemoryStore::new()),
                down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            }
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl CoreStore for FlakyStore {
        fn transaction<T>(
            &self,
            f: impl FnOnce(&mut dyn crate::store::StoreTx) -> Result<T, StoreError>,
        ) -> Result<T, StoreError> {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Io("store offline".to_string()));
            }
            self.inner.transaction(f)
        }

        fn query_ledger(
            &self,
            account_id: AccountId,
            currency: &Currency,
            filter: &LedgerFilter,
            pagination: Pagination,
        ) -> Result<LedgerPage, StoreError> {
            self.inner.query_ledger(account_id, currency, filter, pagination)
        }

        fn all_entries(&self, currency: &Currency) -> Result<Vec<LedgerEntry>, StoreError> {
            self.inner.all_entries(currency)
        }

        fn account_currencies(&self) -> Result<Vec<(AccountId, Currency)>, StoreError> {
            self.inner.account_currencies()
        }

        fn balance(
            &self,
            account_id: AccountId,
            currency: &Currency,
        ) -> Result<Option<marketpay_ledger::Balance>, StoreError> {
            self.inner.balance(account_id, currency)
        }

        fn payout(
            &self,
            payout_id: marketpay_core::PayoutId,
        ) -> Result<Option<marketpay_payouts::Payout>, StoreError> {
            self.inner.payout(payout_id)
        }

        fn insert_subscription(&self, subscription: Subscription) -> Result<(), StoreError> {
            self.inner.insert_subscription(subscription)
        }

        fn due_subscriptions(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<Subscription>, StoreError> {
            self.inner.due_subscriptions(now)
        }

        fn statement(
            &self,
            account_id: AccountId,
            period: marketpay_billing::StatementPeriod,
            currency: &Currency,
        ) -> Result<Option<marketpay_billing::Statement>, StoreError> {
            self.inner.statement(account_id, period, currency)
        }

        fn insert_batch(
            &self,
            batch: marketpay_ledger::SettlementBatch,
        ) -> Result<(), StoreError> {
            self.inner.insert_batch(batch)
        }

        fn latest_batch_run(
            &self,
            currency: &Currency,
        ) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.latest_batch_run(currency)
        }

        fn reserve_key(
            &self,
            record: crate::idempotency::IdempotencyRecord,
        ) -> Result<crate::store::KeyReservation, StoreError> {
            self.inner.reserve_key(record)
        }

        fn key(
            &self,
            key: &str,
        ) -> Result<Option<crate::idempotency::IdempotencyRecord>, StoreError> {
            self.inner.key(key)
        }

        fn update_key(
            &self,
            record: crate::idempotency::IdempotencyRecord,
        ) -> Result<(), StoreError> {
            self.inner.update_key(record)
        }

        fn remove_key(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove_key(key)
        }

        fn claim_key(
            &self,
            key: &str,
            expected_updated_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.claim_key(key, expected_updated_at, now)
        }
    }

    #[test]
    fn transient_store_failure_does_not_poison_the_key() {
        let store = FlakyStore::new();
        let core = PaymentsCore::new(
            store.clone(),
            Arc::new(MockProcessor::new(MockMode::Succeed)),
        );
        let account = AccountId::new();
        let request = charge(account, 10_000, "order-1");

        store.set_down(true);
        let err = core
            .request_operation(&request, "k1", CreatedBy::Api)
            .unwrap_err();
        assert!(matches!(err, CoreError::Operation(OpError::Store(_))));

        // Once the store is back, the same key runs fresh instead of
        // replaying a recorded failure.
        store.set_down(false);
        match core.request_operation(&request, "k1", CreatedBy::Api).unwrap() {
            OperationOutcome::Fresh(_) => {}
            other => panic!("expected fresh execution, got {other:?}"),
        }
        let balance = core.get_balance(account, &Currency::usd()).unwrap().unwrap();
        assert_eq!(balance.lifetime_gross, 10_000);
    }

    #[test]
    fn abandoned_key_with_committed_entries_is_completed_from_the_ledger() {
        use crate::executor::OperationExecutor;
        use crate::idempotency::{CorrelationIds, KeyStatus};

        let store = Arc::new(InMemoryStore::new());
        let processor = Arc::new(MockProcessor::new(MockMode::Succeed));
        let core = PaymentsCore::new(Arc::clone(&store), Arc::clone(&processor));
        let account = AccountId::new();
        let request = charge(account, 10_000, "order-1");
        let t0 = Utc::now();

        // A holder that reserved, committed, and died before completing.
        core.coordinator()
            .reserve(
                "k1",
                request.op_type(),
                &request.payload(),
                CorrelationIds {
                    account_id: account,
                    customer_id: None,
                },
                t0,
            )
            .unwrap();
        let executor = OperationExecutor::new(Arc::clone(&store), processor);
        executor.execute(&request, "k1", CreatedBy::Api, t0).unwrap();

        // Past the lease the retry adopts the key and completes it from the
        // stamped entries instead of charging again.
        let later = t0 + chrono::Duration::hours(1);
        match core
            .request_operation_at(&request, "k1", CreatedBy::Api, later)
            .unwrap()
        {
            OperationOutcome::Replayed(refs) => {
                assert_eq!(refs.ledger_entry_ids.len(), 3);
            }
            other => panic!("expected recovery replay, got {other:?}"),
        }

        let balance = core.get_balance(account, &Currency::usd()).unwrap().unwrap();
        assert_eq!(balance.lifetime_gross, 10_000);
        let record = core.coordinator().record("k1").unwrap().unwrap();
        assert_eq!(record.status, KeyStatus::Completed);
    }

    #[test]
    fn abandoned_key_with_nothing_committed_re_executes() {
        use crate::idempotency::CorrelationIds;

        let core = core(MockMode::Succeed);
        let account = AccountId::new();
        let request = charge(account, 10_000, "order-1");
        let t0 = Utc::now();

        // Reserved, then the holder died before committing anything.
        core.coordinator()
            .reserve(
                "k1",
                request.op_type(),
                &request.payload(),
                CorrelationIds {
                    account_id: account,
                    customer_id: None,
                },
                t0,
            )
            .unwrap();

        let later = t0 + chrono::Duration::hours(1);
        match core
            .request_operation_at(&request, "k1", CreatedBy::Api, later)
            .unwrap()
        {
            OperationOutcome::Fresh(_) => {}
            other => panic!("expected fresh execution, got {other:?}"),
        }
        let balance = core.get_balance(account, &Currency::usd()).unwrap().unwrap();
        assert_eq!(balance.lifetime_gross, 10_000);
    }

    #[test]
    fn get_balance_is_none_for_unknown_accounts() {
        let core = core(MockMode::Succeed);
        assert!(core
            .get_balance(AccountId::new(), &Currency::usd())
            .unwrap()
            .is_none());
    }

    #[test]
    fn targeted_reconciliation_touches_one_account_only() {
        let core = core(MockMode::Succeed);
        let a = AccountId::new();
        let b = AccountId::new();
        core.request_operation(&charge(a, 1_000, "o1"), "k1", CreatedBy::Api)
            .unwrap();
        core.request_operation(&charge(b, 2_000, "o2"), "k2", CreatedBy::Api)
            .unwrap();

        let report = core.trigger_reconciliation(Some(a)).unwrap();
        assert_eq!(report.recomputed, 1);

        let report = core.trigger_reconciliation(None).unwrap();
        assert_eq!(report.recomputed, 2);
    }
}

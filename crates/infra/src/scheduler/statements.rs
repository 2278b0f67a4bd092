//! Monthly statement rollup driver.
//!
//! On each run, finalizes the previous calendar month for every
//! (account, currency) that does not have a statement yet. Statement
//! generation goes through the idempotency coordinator directly — there is
//! no money movement, but the generate-exactly-once guarantee is the same
//! one charges get, under keys `statement:{account}:{year}:{month}:{ccy}`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use marketpay_billing::{Statement, StatementPeriod};
use marketpay_core::{AccountId, Currency};

use crate::executor::OperationType;
use crate::idempotency::{CorrelationIds, Reservation, ResultRefs};
use crate::processor::PaymentProcessor;
use crate::scheduler::DriverReport;
use crate::service::{CoreError, PaymentsCore};
use crate::store::{CoreStore, StoreError};

pub struct StatementDriver<S, P> {
    core: Arc<PaymentsCore<S, P>>,
}

impl<S, P> StatementDriver<S, P>
where
    S: CoreStore + Clone,
    P: PaymentProcessor,
{
    pub fn new(core: Arc<PaymentsCore<S, P>>) -> Self {
        Self { core }
    }

    /// Finalize the month before the one containing `now`.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<DriverReport, CoreError> {
        let period = StatementPeriod::containing(now).previous();
        let mut report = DriverReport::default();

        for (account_id, currency) in self.core.store().account_currencies()? {
            match self.finalize(account_id, &currency, period, now) {
                Ok(Finalized::Generated) => report.processed += 1,
                Ok(Finalized::AlreadyDone) => report.skipped += 1,
                Err(err) => {
                    tracing::error!(
                        account = %account_id,
                        currency = %currency,
                        period = %period,
                        error = %err,
                        "statement rollup failed"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            period = %period,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            "statement driver finished"
        );
        Ok(report)
    }

    fn finalize(
        &self,
        account_id: AccountId,
        currency: &Currency,
        period: StatementPeriod,
        now: DateTime<Utc>,
    ) -> Result<Finalized, CoreError> {
        let key = format!(
            "statement:{}:{}:{}:{}",
            account_id, period.year, period.month, currency
        );
        let payload = json!({
            "account_id": account_id,
            "period": period.to_string(),
            "currency": currency,
        });
        let correlation = CorrelationIds {
            account_id,
            customer_id: None,
        };

        match self.core.coordinator().reserve(
            &key,
            OperationType::Statement,
            &payload,
            correlation,
            now,
        )? {
            Reservation::Replayed(_) | Reservation::StillInProgress => {
                return Ok(Finalized::AlreadyDone);
            }
            Reservation::FailedBefore { error } => {
                return Err(CoreError::Store(StoreError::Io(error)));
            }
            // A takeover of a dead run is safe to re-drive: if the statement
            // row already landed, the insert conflicts and the key completes.
            Reservation::Fresh | Reservation::Abandoned => {}
        }

        let rollup = self.core.store().transaction(|tx| {
            let entries = tx.entries(account_id, currency)?;
            let statement =
                Statement::rollup(account_id, period, currency.clone(), &entries, now);
            tx.insert_statement(statement)?;
            Ok(())
        });

        let refs = ResultRefs {
            statement: Some(period.to_string()),
            ..ResultRefs::default()
        };
        match rollup {
            Ok(()) => {
                self.core.coordinator().complete(&key, refs, now)?;
                Ok(Finalized::Generated)
            }
            // A statement row already exists (written before keys were in
            // use, or by a run that died before completing its key).
            Err(StoreError::Conflict(_)) => {
                self.core.coordinator().complete(&key, refs, now)?;
                Ok(Finalized::AlreadyDone)
            }
            // Infrastructure failure: nothing was written. The key is
            // deterministic for the period, so it must stay usable for the
            // next run rather than record a permanent failure.
            Err(err) => {
                self.core.coordinator().release(&key)?;
                Err(err.into())
            }
        }
    }
}

enum Finalized {
    Generated,
    AlreadyDone,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::OperationRequest;
    use crate::processor::{MockMode, MockProcessor};
    use crate::store::InMemoryStore;
    use chrono::{Datelike, Duration, TimeZone};
    use marketpay_core::{AccountId, CreatedBy};
    use marketpay_ledger::SourceType;

    fn core_with_history() -> (
        Arc<PaymentsCore<Arc<InMemoryStore>, Arc<MockProcessor>>>,
        AccountId,
    ) {
        let core = Arc::new(PaymentsCore::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(MockProcessor::new(MockMode::Succeed)),
        ));
        let account = AccountId::new();
        core.request_operation(
            &OperationRequest::SettleCharge {
                account_id: account,
                currency: Currency::usd(),
                gross: 10_000,
                source_type: SourceType::Order,
                source_reference: "order-1".to_string(),
                customer_id: None,
            },
            "k1",
            CreatedBy::Api,
        )
        .unwrap();
        (core, account)
    }

    #[test]
    fn previous_month_is_rolled_up_exactly_once() {
        let (core, account) = core_with_history();
        let driver = StatementDriver::new(Arc::clone(&core));

        // Run "next month" so the charge falls in the closed period.
        let now = Utc::now();
        let next_month = Utc
            .with_ymd_and_hms(
                if now.month() == 12 { now.year() + 1 } else { now.year() },
                if now.month() == 12 { 1 } else { now.month() + 1 },
                15,
                0,
                0,
                0,
            )
            .unwrap();

        let report = driver.run_once(next_month).unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let period = StatementPeriod::containing(next_month).previous();
        let statement = core
            .store()
            .statement(account, period, &Currency::usd())
            .unwrap()
            .unwrap();
        assert_eq!(statement.gross, 10_000);
        assert_eq!(statement.fees, 320 + 100);

        // Second run is a no-op.
        let rerun = driver.run_once(next_month + Duration::hours(1)).unwrap();
        assert_eq!(rerun.processed, 0);
        assert_eq!(rerun.skipped, 1);
    }

    #[test]
    fn interrupted_rollup_is_finished_by_a_later_run() {
        use crate::idempotency::KeyStatus;

        let (core, account) = core_with_history();
        let driver = StatementDriver::new(Arc::clone(&core));

        let now = Utc::now();
        let next_month = Utc
            .with_ymd_and_hms(
                if now.month() == 12 { now.year() + 1 } else { now.year() },
                if now.month() == 12 { 1 } else { now.month() + 1 },
                15,
                0,
                0,
                0,
            )
            .unwrap();
        let period = StatementPeriod::containing(next_month).previous();

        // A run that reserved the key, wrote the row, and died before
        // completing.
        let key = format!(
            "statement:{}:{}:{}:{}",
            account,
            period.year,
            period.month,
            Currency::usd()
        );
        let payload = serde_json::json!({
            "account_id": account,
            "period": period.to_string(),
            "currency": Currency::usd(),
        });
        core.coordinator()
            .reserve(
                &key,
                OperationType::Statement,
                &payload,
                CorrelationIds {
                    account_id: account,
                    customer_id: None,
                },
                next_month,
            )
            .unwrap();
        core.store()
            .transaction(|tx| {
                let entries = tx.entries(account, &Currency::usd())?;
                tx.insert_statement(Statement::rollup(
                    account,
                    period,
                    Currency::usd(),
                    &entries,
                    next_month,
                ))
            })
            .unwrap();

        // Past the lease, the next run adopts the key, hits the existing row
        // and completes the key instead of wedging on it.
        let later = next_month + Duration::hours(1);
        let report = driver.run_once(later).unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.skipped, 1);

        let record = core.coordinator().record(&key).unwrap().unwrap();
        assert_eq!(record.status, KeyStatus::Completed);
    }

    #[test]
    fn empty_previous_month_still_generates_a_statement() {
        let (core, account) = core_with_history();
        let driver = StatementDriver::new(Arc::clone(&core));

        // Current month: the charge is in the open period, the closed one is
        // empty.
        let report = driver.run_once(Utc::now()).unwrap();
        assert_eq!(report.processed, 1);

        let period = StatementPeriod::containing(Utc::now()).previous();
        let statement = core
            .store()
            .statement(account, period, &Currency::usd())
            .unwrap()
            .unwrap();
        assert_eq!(statement.entry_count, 0);
        assert_eq!(statement.net, 0);
    }
}

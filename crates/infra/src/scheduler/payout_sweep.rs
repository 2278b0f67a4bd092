//! Daily payout sweep.
//!
//! For every (account, currency) with activity: recompute the balance, and
//! if the available funds clear the minimum, pay the whole available amount
//! out. Keys are `payout-sweep:{date}:{account}:{currency}`, one per account
//! per day, so a re-run of the same day replays instead of paying twice.
//!
//! After sweeping, the run records an observational [`SettlementBatch`]
//! covering everything that crossed pending→available since the previous
//! batch. Batches are bookkeeping for reconciliation reports; balances never
//! read them.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use marketpay_core::{CreatedBy, Currency, MinorUnits};
use marketpay_ledger::SettlementBatch;

use crate::executor::OperationRequest;
use crate::processor::PaymentProcessor;
use crate::scheduler::DriverReport;
use crate::service::{CoreError, OperationOutcome, PaymentsCore};
use crate::store::CoreStore;

/// Default sweep floor: accounts below this keep accruing instead of
/// receiving dust transfers.
pub const DEFAULT_PAYOUT_MINIMUM: MinorUnits = 1_000;

pub struct PayoutSweepDriver<S, P> {
    core: Arc<PaymentsCore<S, P>>,
    payout_minimum: MinorUnits,
}

impl<S, P> PayoutSweepDriver<S, P>
where
    S: CoreStore + Clone,
    P: PaymentProcessor,
{
    pub fn new(core: Arc<PaymentsCore<S, P>>) -> Self {
        Self {
            core,
            payout_minimum: DEFAULT_PAYOUT_MINIMUM,
        }
    }

    pub fn with_minimum(mut self, payout_minimum: MinorUnits) -> Self {
        self.payout_minimum = payout_minimum;
        self
    }

    pub fn run_once(&self, now: DateTime<Utc>) -> Result<DriverReport, CoreError> {
        let mut report = DriverReport::default();
        let mut currencies: Vec<Currency> = Vec::new();

        for (account_id, currency) in self.core.store().account_currencies()? {
            if !currencies.contains(&currency) {
                currencies.push(currency.clone());
            }

            // Fresh fold first: the sweep must see funds that crossed the
            // settlement window since the last recompute.
            let balance = self.core.materializer().recompute(account_id, &currency, now)?;
            if balance.available < self.payout_minimum as i64 {
                report.skipped += 1;
                continue;
            }

            let amount = balance.available as MinorUnits;
            let key = format!(
                "payout-sweep:{}:{}:{}",
                now.date_naive(),
                account_id,
                currency
            );
            let request = OperationRequest::Payout {
                account_id,
                currency: currency.clone(),
                amount,
            };

            match self
                .core
                .request_operation_at(&request, &key, CreatedBy::Cron, now)
            {
                Ok(OperationOutcome::Fresh(_)) => report.processed += 1,
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    tracing::error!(
                        account = %account_id,
                        currency = %currency,
                        error = %err,
                        "sweep payout failed"
                    );
                    report.failed += 1;
                }
            }
        }

        for currency in &currencies {
            self.record_batch(currency, now)?;
        }

        tracing::info!(
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            "payout sweep finished"
        );
        Ok(report)
    }

    fn record_batch(&self, currency: &Currency, run_at: DateTime<Utc>) -> Result<(), CoreError> {
        let window_start = self
            .core
            .store()
            .latest_batch_run(currency)?
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let entries = self.core.store().all_entries(currency)?;
        let batch = SettlementBatch::from_window(currency.clone(), &entries, window_start, run_at);

        tracing::debug!(
            currency = %currency,
            total = batch.total_amount,
            accounts = batch.subtotals.len(),
            "recording settlement batch"
        );
        Ok(self.core.store().insert_batch(batch)?)
    }
}

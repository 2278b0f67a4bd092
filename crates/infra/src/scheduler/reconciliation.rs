//! Nightly reconciliation driver.
//!
//! A thin wrapper over the materializer's full sweep. No idempotency key:
//! recomputing a balance is naturally idempotent, so running twice is merely
//! redundant, never wrong.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::processor::PaymentProcessor;
use crate::scheduler::DriverReport;
use crate::service::{CoreError, PaymentsCore};
use crate::store::CoreStore;

pub struct ReconciliationDriver<S, P> {
    core: Arc<PaymentsCore<S, P>>,
}

impl<S, P> ReconciliationDriver<S, P>
where
    S: CoreStore + Clone,
    P: PaymentProcessor,
{
    pub fn new(core: Arc<PaymentsCore<S, P>>) -> Self {
        Self { core }
    }

    pub fn run_once(&self, now: DateTime<Utc>) -> Result<DriverReport, CoreError> {
        let report = self.core.materializer().reconcile_all(now)?;
        Ok(DriverReport {
            processed: report.recomputed,
            skipped: 0,
            failed: report.failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::OperationRequest;
    use crate::processor::{MockMode, MockProcessor};
    use crate::store::InMemoryStore;
    use chrono::Duration;
    use marketpay_core::{AccountId, CreatedBy, Currency};
    use marketpay_ledger::SourceType;

    #[test]
    fn nightly_sweep_moves_settled_funds_out_of_pending() {
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

        let before = core.get_balance(account, &Currency::usd()).unwrap().unwrap();
        assert!(before.pending > 0);
        assert_eq!(before.available, 0);

        let driver = ReconciliationDriver::new(Arc::clone(&core));
        let report = driver.run_once(Utc::now() + Duration::days(8)).unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let after = core.get_balance(account, &Currency::usd()).unwrap().unwrap();
        assert_eq!(after.pending, 0);
        assert_eq!(after.available, before.pending);
        // Total is unchanged by the recompute.
        assert_eq!(after.total, before.total);
    }
}

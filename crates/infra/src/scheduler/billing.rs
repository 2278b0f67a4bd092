//! Recurring billing driver.
//!
//! Picks up every due subscription and settles one charge per billing cycle.
//! The idempotency key is anchored on the cycle (`billing:{id}:{anchor}`), so
//! re-running after a crash never bills a cycle twice; a processor decline
//! flags the subscription past_due without touching any balance.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use marketpay_core::CreatedBy;
use marketpay_ledger::SourceType;

use crate::executor::{OpError, OperationRequest};
use crate::processor::PaymentProcessor;
use crate::scheduler::DriverReport;
use crate::service::{CoreError, OperationOutcome, PaymentsCore};
use crate::store::{CoreStore, StoreError};

pub struct BillingDriver<S, P> {
    core: Arc<PaymentsCore<S, P>>,
}

impl<S, P> BillingDriver<S, P>
where
    S: CoreStore + Clone,
    P: PaymentProcessor,
{
    pub fn new(core: Arc<PaymentsCore<S, P>>) -> Self {
        Self { core }
    }

    pub fn run_once(&self, now: DateTime<Utc>) -> Result<DriverReport, CoreError> {
        let due = self.core.store().due_subscriptions(now)?;
        let mut report = DriverReport::default();

        for subscription in due {
            let key = format!(
                "billing:{}:{}",
                subscription.id,
                subscription.next_billing_at.timestamp()
            );
            let request = OperationRequest::SettleCharge {
                account_id: subscription.account_id,
                currency: subscription.currency.clone(),
                gross: subscription.amount,
                source_type: SourceType::Subscription,
                source_reference: subscription.id.to_string(),
                customer_id: Some(subscription.customer_id),
            };

            match self
                .core
                .request_operation_at(&request, &key, CreatedBy::Cron, now)
            {
                Ok(OperationOutcome::Fresh(_)) => {
                    self.advance(&subscription.id, subscription.next_billing_at)?;
                    report.processed += 1;
                }
                // The charge committed in an earlier run that died before
                // advancing the cycle; finish the advance now.
                Ok(OperationOutcome::Replayed(_)) => {
                    self.advance(&subscription.id, subscription.next_billing_at)?;
                    report.skipped += 1;
                }
                Ok(OperationOutcome::InProgress) => {
                    report.skipped += 1;
                }
                Ok(OperationOutcome::FailedBefore { error }) => {
                    tracing::warn!(
                        subscription = %subscription.id,
                        error,
                        "cycle previously failed, flagging past_due"
                    );
                    self.flag_past_due(&subscription.id)?;
                    report.failed += 1;
                }
                Err(CoreError::Operation(OpError::Processor(reason))) => {
                    tracing::warn!(
                        subscription = %subscription.id,
                        reason,
                        "billing charge declined, flagging past_due"
                    );
                    self.flag_past_due(&subscription.id)?;
                    report.failed += 1;
                }
                Err(err) => {
                    tracing::error!(
                        subscription = %subscription.id,
                        error = %err,
                        "billing run error, will retry next run"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            "billing driver finished"
        );
        Ok(report)
    }

    /// Advance the cycle anchor, guarded against double-advance: only the run
    /// that still sees the old anchor moves it.
    fn advance(
        &self,
        subscription_id: &marketpay_core::SubscriptionId,
        expected_anchor: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let id = *subscription_id;
        Ok(self.core.store().transaction(|tx| {
            let Some(mut subscription) = tx.subscription(id)? else {
                return Err(StoreError::NotFound(format!("subscription {id}")));
            };
            if subscription.next_billing_at == expected_anchor {
                subscription.advance_cycle();
                tx.put_subscription(subscription)?;
            }
            Ok(())
        })?)
    }

    fn flag_past_due(
        &self,
        subscription_id: &marketpay_core::SubscriptionId,
    ) -> Result<(), CoreError> {
        let id = *subscription_id;
        Ok(self.core.store().transaction(|tx| {
            let Some(mut subscription) = tx.subscription(id)? else {
                return Err(StoreError::NotFound(format!("subscription {id}")));
            };
            subscription.mark_past_due();
            tx.put_subscription(subscription)?;
            Ok(())
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{MockMode, MockProcessor};
    use crate::store::InMemoryStore;
    use chrono::Duration;
    use marketpay_billing::{BillingInterval, Subscription, SubscriptionStatus};
    use marketpay_core::{AccountId, Currency, CustomerId};

    fn setup(mode: MockMode) -> (Arc<PaymentsCore<Arc<InMemoryStore>, Arc<MockProcessor>>>, Subscription) {
        let core = Arc::new(PaymentsCore::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(MockProcessor::new(mode)),
        ));
        let subscription = Subscription::new(
            AccountId::new(),
            CustomerId::new(),
            2_500,
            Currency::usd(),
            BillingInterval::Monthly,
            Utc::now() - Duration::hours(1),
        );
        core.create_subscription(subscription.clone()).unwrap();
        (core, subscription)
    }

    #[test]
    fn due_subscription_is_billed_once_per_cycle() {
        let (core, subscription) = setup(MockMode::Succeed);
        let driver = BillingDriver::new(Arc::clone(&core));
        let now = Utc::now();

        let report = driver.run_once(now).unwrap();
        assert_eq!(report.processed, 1);

        // Second run inside the same cycle: nothing is due any more.
        let report = driver.run_once(now).unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, 0);

        let balance = core
            .get_balance(subscription.account_id, &Currency::usd())
            .unwrap()
            .unwrap();
        assert_eq!(balance.lifetime_gross, 2_500);
    }

    #[test]
    fn declined_charge_flags_past_due_without_balance_changes() {
        let (core, subscription) = setup(MockMode::Decline);
        let driver = BillingDriver::new(Arc::clone(&core));

        let report = driver.run_once(Utc::now()).unwrap();
        assert_eq!(report.failed, 1);

        let stored = core
            .store()
            .transaction(|tx| tx.subscription(subscription.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
        assert!(core
            .get_balance(subscription.account_id, &Currency::usd())
            .unwrap()
            .is_none());
    }

    #[test]
    fn crashed_cycle_is_recovered_and_advanced_without_a_second_charge() {
        use crate::executor::OperationExecutor;
        use crate::idempotency::CorrelationIds;

        let (core, subscription) = setup(MockMode::Succeed);
        let anchor = subscription.next_billing_at;
        let key = format!("billing:{}:{}", subscription.id, anchor.timestamp());
        let request = OperationRequest::SettleCharge {
            account_id: subscription.account_id,
            currency: subscription.currency.clone(),
            gross: subscription.amount,
            source_type: SourceType::Subscription,
            source_reference: subscription.id.to_string(),
            customer_id: Some(subscription.customer_id),
        };

        // A run that reserved the key and committed the charge, then died
        // before completing the key or advancing the cycle.
        core.coordinator()
            .reserve(
                &key,
                request.op_type(),
                &request.payload(),
                CorrelationIds {
                    account_id: subscription.account_id,
                    customer_id: Some(subscription.customer_id),
                },
                anchor,
            )
            .unwrap();
        let executor = OperationExecutor::new(
            core.store().clone(),
            Arc::new(MockProcessor::new(MockMode::Succeed)),
        );
        executor
            .execute(&request, &key, CreatedBy::Cron, anchor)
            .unwrap();

        // Past the lease, the driver adopts the key, recovers the committed
        // charge and advances the cycle; no second charge lands.
        let driver = BillingDriver::new(Arc::clone(&core));
        let report = driver.run_once(anchor + Duration::hours(1)).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);

        let stored = core
            .store()
            .transaction(|tx| tx.subscription(subscription.id))
            .unwrap()
            .unwrap();
        assert!(stored.next_billing_at > anchor);

        let balance = core
            .get_balance(subscription.account_id, &Currency::usd())
            .unwrap()
            .unwrap();
        assert_eq!(balance.lifetime_gross, 2_500);
    }

    #[test]
    fn failed_cycle_is_not_retried_under_the_same_key() {
        let (core, subscription) = setup(MockMode::Decline);
        let driver = BillingDriver::new(Arc::clone(&core));
        driver.run_once(Utc::now()).unwrap();

        // Same cycle anchor means the same key: the recorded failure is
        // replayed instead of hitting the processor again.
        let report = driver.run_once(Utc::now()).unwrap();
        assert_eq!(report.failed, 1);

        let stored = core
            .store()
            .transaction(|tx| tx.subscription(subscription.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
    }
}

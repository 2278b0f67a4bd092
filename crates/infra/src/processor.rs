//! External payment processor boundary.
//!
//! The core never talks to card networks or bank rails directly; it calls a
//! [`PaymentProcessor`] and records the outcome in the ledger. Every call
//! carries the operation's idempotency key so the processor side dedupes the
//! same way the core does.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use marketpay_core::{AccountId, Currency, CustomerId, MinorUnits};

/// Processor-side outcome of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorStatus {
    /// Accepted but not yet final (bank rails).
    Pending,
    Succeeded,
    Failed,
}

/// What the processor said about one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorReceipt {
    pub status: ProcessorStatus,
    /// Processor-side reference for reconciliation.
    pub external_id: String,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The processor rejected the request (declined card, closed account).
    #[error("processor declined: {0}")]
    Declined(String),

    /// Transport-level failure; outcome unknown, safe to retry with the
    /// same idempotency key.
    #[error("processor unreachable: {0}")]
    Unavailable(String),
}

/// Outbound boundary to the card/bank processor.
pub trait PaymentProcessor: Send + Sync {
    fn create_charge(
        &self,
        idempotency_key: &str,
        customer_id: Option<CustomerId>,
        amount: MinorUnits,
        currency: &Currency,
    ) -> Result<ProcessorReceipt, ProcessorError>;

    fn create_refund(
        &self,
        idempotency_key: &str,
        charge_reference: &str,
        amount: MinorUnits,
        currency: &Currency,
    ) -> Result<ProcessorReceipt, ProcessorError>;

    fn create_payout(
        &self,
        idempotency_key: &str,
        account_id: AccountId,
        amount: MinorUnits,
        currency: &Currency,
    ) -> Result<ProcessorReceipt, ProcessorError>;
}

impl<P> PaymentProcessor for std::sync::Arc<P>
where
    P: PaymentProcessor + ?Sized,
{
    fn create_charge(
        &self,
        idempotency_key: &str,
        customer_id: Option<CustomerId>,
        amount: MinorUnits,
        currency: &Currency,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        (**self).create_charge(idempotency_key, customer_id, amount, currency)
    }

    fn create_refund(
        &self,
        idempotency_key: &str,
        charge_reference: &str,
        amount: MinorUnits,
        currency: &Currency,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        (**self).create_refund(idempotency_key, charge_reference, amount, currency)
    }

    fn create_payout(
        &self,
        idempotency_key: &str,
        account_id: AccountId,
        amount: MinorUnits,
        currency: &Currency,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        (**self).create_payout(idempotency_key, account_id, amount, currency)
    }
}

/// How the mock answers calls it has not seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMode {
    Succeed,
    /// Payouts land as pending (bank rails), everything else succeeds.
    PendingPayouts,
    Decline,
    Unavailable,
}

/// Deterministic in-process processor for tests.
///
/// Replays the recorded receipt when a key repeats, which mirrors real
/// processor idempotency and lets tests assert that retries do not create
/// duplicate external calls.
pub struct MockProcessor {
    mode: Mutex<MockMode>,
    receipts: Mutex<HashMap<String, ProcessorReceipt>>,
    calls: Mutex<Vec<String>>,
}

impl MockProcessor {
    pub fn new(mode: MockMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            receipts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(MockMode::Succeed)
    }

    pub fn set_mode(&self, mode: MockMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Every key the mock has been called with, in order, repeats included.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, idempotency_key: &str) -> Result<ProcessorReceipt, ProcessorError> {
        self.calls.lock().unwrap().push(idempotency_key.to_string());

        let mut receipts = self.receipts.lock().unwrap();
        if let Some(previous) = receipts.get(idempotency_key) {
            return Ok(previous.clone());
        }

        let mode = *self.mode.lock().unwrap();
        let receipt = match mode {
            MockMode::Succeed => ProcessorReceipt {
                status: ProcessorStatus::Succeeded,
                external_id: format!("ext_{}", Uuid::now_v7().simple()),
            },
            MockMode::PendingPayouts => ProcessorReceipt {
                status: ProcessorStatus::Pending,
                external_id: format!("ext_{}", Uuid::now_v7().simple()),
            },
            MockMode::Decline => {
                return Err(ProcessorError::Declined("card declined".to_string()));
            }
            MockMode::Unavailable => {
                return Err(ProcessorError::Unavailable("connection reset".to_string()));
            }
        };
        receipts.insert(idempotency_key.to_string(), receipt.clone());
        Ok(receipt)
    }
}

impl PaymentProcessor for MockProcessor {
    fn create_charge(
        &self,
        idempotency_key: &str,
        _customer_id: Option<CustomerId>,
        _amount: MinorUnits,
        _currency: &Currency,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        self.answer(idempotency_key)
    }

    fn create_refund(
        &self,
        idempotency_key: &str,
        _charge_reference: &str,
        _amount: MinorUnits,
        _currency: &Currency,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        self.answer(idempotency_key)
    }

    fn create_payout(
        &self,
        idempotency_key: &str,
        _account_id: AccountId,
        _amount: MinorUnits,
        _currency: &Currency,
    ) -> Result<ProcessorReceipt, ProcessorError> {
        self.answer(idempotency_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_key_replays_the_same_receipt() {
        let processor = MockProcessor::succeeding();
        let first = processor
            .create_charge("k1", None, 1_000, &Currency::usd())
            .unwrap();
        let second = processor
            .create_charge("k1", None, 1_000, &Currency::usd())
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(processor.calls().len(), 2);
    }

    #[test]
    fn decline_mode_returns_declined() {
        let processor = MockProcessor::new(MockMode::Decline);
        let err = processor
            .create_payout("k1", AccountId::new(), 500, &Currency::usd())
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Declined(_)));
    }

    #[test]
    fn mode_switch_applies_to_unseen_keys_only() {
        let processor = MockProcessor::succeeding();
        let receipt = processor
            .create_refund("k1", "order-1", 100, &Currency::usd())
            .unwrap();

        processor.set_mode(MockMode::Decline);
        // Known key still replays.
        assert_eq!(
            processor
                .create_refund("k1", "order-1", 100, &Currency::usd())
                .unwrap(),
            receipt
        );
        // New key hits the new mode.
        assert!(processor
            .create_refund("k2", "order-1", 100, &Currency::usd())
            .is_err());
    }
}

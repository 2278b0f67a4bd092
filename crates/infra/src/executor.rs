//! Transactional operation executor.
//!
//! Each operation validates against the current balance, appends its ledger
//! entries, and updates the materialized balance inside one store
//! transaction. The balance written is always a full fold of the account
//! stream, so an operation can never leave the snapshot out of sync with the
//! ledger it just extended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use marketpay_core::{AccountId, CreatedBy, Currency, CustomerId, EntryId, MinorUnits};
use marketpay_ledger::{
    Balance, Direction, EntryStatus, EntryType, FeePolicy, LedgerEntry, SettlementPolicy,
    SourceType, UnpostedEntry,
};
use marketpay_payouts::Payout;

use crate::idempotency::ResultRefs;
use crate::processor::{PaymentProcessor, ProcessorStatus};
use crate::store::{CoreStore, StoreError, StoreTx};

/// Category of a keyed operation, recorded on the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Charge,
    Refund,
    Payout,
    Adjustment,
    DisputeOpen,
    DisputeResolve,
    Statement,
}

/// One money-moving request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationRequest {
    /// Capture a charge with the processor and settle it into the account.
    SettleCharge {
        account_id: AccountId,
        currency: Currency,
        gross: MinorUnits,
        source_type: SourceType,
        source_reference: String,
        customer_id: Option<CustomerId>,
    },
    /// Refund part or all of a previously settled charge.
    Refund {
        account_id: AccountId,
        currency: Currency,
        amount: MinorUnits,
        charge_reference: String,
    },
    /// Pay out available funds to the account holder.
    Payout {
        account_id: AccountId,
        currency: Currency,
        amount: MinorUnits,
    },
    /// Manual correction, admin-driven.
    Adjustment {
        account_id: AccountId,
        currency: Currency,
        amount: MinorUnits,
        direction: Direction,
        reason: String,
    },
    /// Place a dispute hold against a settled charge.
    OpenDispute {
        account_id: AccountId,
        currency: Currency,
        amount: MinorUnits,
        charge_reference: String,
    },
    /// Resolve the open dispute on a charge.
    ResolveDispute {
        account_id: AccountId,
        currency: Currency,
        charge_reference: String,
        won: bool,
    },
}

impl OperationRequest {
    pub fn op_type(&self) -> OperationType {
        match self {
            OperationRequest::SettleCharge { .. } => OperationType::Charge,
            OperationRequest::Refund { .. } => OperationType::Refund,
            OperationRequest::Payout { .. } => OperationType::Payout,
            OperationRequest::Adjustment { .. } => OperationType::Adjustment,
            OperationRequest::OpenDispute { .. } => OperationType::DisputeOpen,
            OperationRequest::ResolveDispute { .. } => OperationType::DisputeResolve,
        }
    }

    pub fn account_id(&self) -> AccountId {
        match self {
            OperationRequest::SettleCharge { account_id, .. }
            | OperationRequest::Refund { account_id, .. }
            | OperationRequest::Payout { account_id, .. }
            | OperationRequest::Adjustment { account_id, .. }
            | OperationRequest::OpenDispute { account_id, .. }
            | OperationRequest::ResolveDispute { account_id, .. } => *account_id,
        }
    }

    pub fn currency(&self) -> &Currency {
        match self {
            OperationRequest::SettleCharge { currency, .. }
            | OperationRequest::Refund { currency, .. }
            | OperationRequest::Payout { currency, .. }
            | OperationRequest::Adjustment { currency, .. }
            | OperationRequest::OpenDispute { currency, .. }
            | OperationRequest::ResolveDispute { currency, .. } => currency,
        }
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        match self {
            OperationRequest::SettleCharge { customer_id, .. } => *customer_id,
            _ => None,
        }
    }

    /// Canonical JSON payload, the input to the idempotency hash.
    pub fn payload(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Why an operation did not commit. Nothing was persisted unless the variant
/// says otherwise ([`OpError::Processor`] during a payout leaves the payout
/// record marked failed plus its reversal entries).
#[derive(Debug, Error)]
pub enum OpError {
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: MinorUnits,
        available: i64,
    },

    #[error("no balance history for this account and currency")]
    BalanceNotFound,

    #[error("refund exceeds refundable remainder ({refundable})")]
    AlreadyRefunded { refundable: MinorUnits },

    #[error("invalid operation: {0}")]
    Validation(String),

    #[error("processor failure: {0}")]
    Processor(String),

    /// Lost a commit race; the operation may be retried as-is.
    #[error("concurrent conflict: {0}")]
    ConcurrentConflict(String),

    #[error(transparent)]
    Store(StoreError),
}

impl OpError {
    /// True when nothing was committed and the same key may be retried once
    /// the underlying condition clears.
    pub fn is_transient(&self) -> bool {
        matches!(self, OpError::ConcurrentConflict(_) | OpError::Store(_))
    }
}

impl From<StoreError> for OpError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => OpError::ConcurrentConflict(msg),
            other => OpError::Store(other),
        }
    }
}

/// Executes validated operations against the store and the processor.
pub struct OperationExecutor<S, P> {
    store: S,
    processor: P,
    fees: FeePolicy,
    settlement: SettlementPolicy,
    tax_withholding_rate: f64,
}

impl<S: CoreStore, P: PaymentProcessor> OperationExecutor<S, P> {
    pub fn new(store: S, processor: P) -> Self {
        Self {
            store,
            processor,
            fees: FeePolicy::default(),
            settlement: SettlementPolicy::default(),
            tax_withholding_rate: 0.0,
        }
    }

    pub fn with_fees(mut self, fees: FeePolicy) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_settlement(mut self, settlement: SettlementPolicy) -> Self {
        self.settlement = settlement;
        self
    }

    /// Flat withholding applied to every payout (0.0 disables it).
    pub fn with_tax_withholding(mut self, rate: f64) -> Self {
        self.tax_withholding_rate = rate;
        self
    }

    /// Execute one operation under an already-reserved idempotency key.
    ///
    /// The caller (the service facade) owns key reservation and result
    /// recording; this method only moves money.
    pub fn execute(
        &self,
        request: &OperationRequest,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
    ) -> Result<ResultRefs, OpError> {
        match request {
            OperationRequest::SettleCharge {
                account_id,
                currency,
                gross,
                source_type,
                source_reference,
                customer_id,
            } => self.settle_charge(
                *account_id,
                currency,
                *gross,
                *source_type,
                source_reference,
                *customer_id,
                idempotency_key,
                created_by,
                now,
            ),
            OperationRequest::Refund {
                account_id,
                currency,
                amount,
                charge_reference,
            } => self.refund(
                *account_id,
                currency,
                *amount,
                charge_reference,
                idempotency_key,
                created_by,
                now,
            ),
            OperationRequest::Payout {
                account_id,
                currency,
                amount,
            } => self.payout(*account_id, currency, *amount, idempotency_key, created_by, now),
            OperationRequest::Adjustment {
                account_id,
                currency,
                amount,
                direction,
                reason,
            } => self.adjustment(
                *account_id,
                currency,
                *amount,
                *direction,
                reason,
                idempotency_key,
                created_by,
                now,
            ),
            OperationRequest::OpenDispute {
                account_id,
                currency,
                amount,
                charge_reference,
            } => self.open_dispute(
                *account_id,
                currency,
                *amount,
                charge_reference,
                idempotency_key,
                created_by,
                now,
            ),
            OperationRequest::ResolveDispute {
                account_id,
                currency,
                charge_reference,
                won,
            } => self.resolve_dispute(
                *account_id,
                currency,
                charge_reference,
                *won,
                idempotency_key,
                created_by,
                now,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_charge(
        &self,
        account_id: AccountId,
        currency: &Currency,
        gross: MinorUnits,
        source_type: SourceType,
        source_reference: &str,
        customer_id: Option<CustomerId>,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
    ) -> Result<ResultRefs, OpError> {
        if gross == 0 {
            return Err(OpError::Validation("charge amount must be positive".to_string()));
        }

        // Capture with the processor first; a decline must leave the ledger
        // untouched. The processor dedupes on our key, so a retry after a
        // crash between capture and commit does not double-charge.
        let receipt = self
            .processor
            .create_charge(idempotency_key, customer_id, gross, currency)
            .map_err(|e| OpError::Processor(e.to_string()))?;

        let breakdown = self.fees.assess(gross);
        tracing::info!(
            account = %account_id,
            gross,
            processor_fee = breakdown.processor_fee,
            platform_fee = breakdown.platform_fee,
            "settling charge"
        );

        let entries = self.store.transaction(|tx| {
            let mut entries = Vec::new();
            entries.push(tx.append_entry(self.entry(
                account_id,
                EntryType::Charge,
                Direction::Credit,
                gross,
                currency,
                source_type,
                source_reference,
                idempotency_key,
                created_by,
                now,
                json!({ "external_id": receipt.external_id }),
            ))?);
            entries.push(tx.append_entry(self.entry(
                account_id,
                EntryType::Fee,
                Direction::Debit,
                breakdown.processor_fee,
                currency,
                source_type,
                source_reference,
                idempotency_key,
                created_by,
                now,
                json!({ "fee_kind": "processor" }),
            ))?);
            if breakdown.platform_fee > 0 {
                entries.push(tx.append_entry(self.entry(
                    account_id,
                    EntryType::Fee,
                    Direction::Debit,
                    breakdown.platform_fee,
                    currency,
                    source_type,
                    source_reference,
                    idempotency_key,
                    created_by,
                    now,
                    json!({ "fee_kind": "platform" }),
                ))?);
            }
            rebalance(tx, account_id, currency, now)?;
            Ok(entries)
        })?;

        Ok(ResultRefs {
            ledger_entry_ids: entries.iter().map(|e| e.id).collect(),
            payout_id: None,
            statement: None,
            external_id: Some(receipt.external_id),
        })
    }

    fn refund(
        &self,
        account_id: AccountId,
        currency: &Currency,
        amount: MinorUnits,
        charge_reference: &str,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
    ) -> Result<ResultRefs, OpError> {
        if amount == 0 {
            return Err(OpError::Validation("refund amount must be positive".to_string()));
        }

        // Validate before touching the processor so an over-refund never
        // reaches the card network.
        let (gross, refundable) = self.store.transaction(|tx| {
            Ok(refundable_remainder(tx, account_id, currency, charge_reference)?)
        })?;
        let Some(gross) = gross else {
            return Err(OpError::Validation(format!(
                "no settled charge found for {charge_reference}"
            )));
        };
        if amount > refundable {
            return Err(OpError::AlreadyRefunded { refundable });
        }

        let receipt = self
            .processor
            .create_refund(idempotency_key, charge_reference, amount, currency)
            .map_err(|e| OpError::Processor(e.to_string()))?;

        let original = self.fees.assess(gross);
        let reversal = self.fees.refund_reversal(&original, amount);
        tracing::info!(
            account = %account_id,
            amount,
            charge_reference,
            "posting refund"
        );

        let entries = self.store.transaction(|tx| {
            // Re-check under the transaction; a concurrent refund may have
            // consumed the remainder since validation.
            let (_, refundable) =
                refundable_remainder(tx, account_id, currency, charge_reference)?;
            if amount > refundable {
                return Err(StoreError::Conflict(format!(
                    "refundable remainder shrank below {amount}"
                )));
            }

            let mut entries = Vec::new();
            entries.push(tx.append_entry(self.entry(
                account_id,
                EntryType::Refund,
                Direction::Debit,
                amount,
                currency,
                SourceType::Refund,
                charge_reference,
                idempotency_key,
                created_by,
                now,
                json!({ "external_id": receipt.external_id }),
            ))?);
            if reversal.processor_fee > 0 {
                entries.push(tx.append_entry(self.entry(
                    account_id,
                    EntryType::Fee,
                    Direction::Credit,
                    reversal.processor_fee,
                    currency,
                    SourceType::Refund,
                    charge_reference,
                    idempotency_key,
                    created_by,
                    now,
                    json!({ "fee_kind": "processor" }),
                ))?);
            }
            if reversal.platform_fee > 0 {
                entries.push(tx.append_entry(self.entry(
                    account_id,
                    EntryType::Fee,
                    Direction::Credit,
                    reversal.platform_fee,
                    currency,
                    SourceType::Refund,
                    charge_reference,
                    idempotency_key,
                    created_by,
                    now,
                    json!({ "fee_kind": "platform" }),
                ))?);
            }
            rebalance(tx, account_id, currency, now)?;
            Ok(entries)
        })?;

        Ok(ResultRefs {
            ledger_entry_ids: entries.iter().map(|e| e.id).collect(),
            payout_id: None,
            statement: None,
            external_id: Some(receipt.external_id),
        })
    }

    fn payout(
        &self,
        account_id: AccountId,
        currency: &Currency,
        amount: MinorUnits,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
    ) -> Result<ResultRefs, OpError> {
        if amount == 0 {
            return Err(OpError::Validation("payout amount must be positive".to_string()));
        }

        let tax_withheld = (amount as f64 * self.tax_withholding_rate).round() as MinorUnits;
        let mut payout = Payout::new(account_id, amount, 0, tax_withheld, currency.clone(), now);
        let payout_id = payout.id;

        // Debit first, transfer second. If the process dies between the two,
        // the funds are already held and the retry (same key) resumes at the
        // processor, which dedupes.
        let entry_ids = self.store.transaction(|tx| {
            let history = tx.entries(account_id, currency)?;
            if history.is_empty() {
                return Err(StoreError::NotFound("no balance history".to_string()));
            }
            let balance = Balance::fold(account_id, currency.clone(), &history, now);
            if (amount as i64) > balance.available {
                return Err(StoreError::Invalid(format!(
                    "insufficient:{}",
                    balance.available
                )));
            }

            let mut entry_ids = Vec::new();
            let debit = tx.append_entry(self.entry(
                account_id,
                EntryType::Payout,
                Direction::Debit,
                payout.net_amount,
                currency,
                SourceType::Payout,
                &payout_id.to_string(),
                idempotency_key,
                created_by,
                now,
                JsonValue::Null,
            ))?;
            entry_ids.push(debit.id);
            if tax_withheld > 0 {
                let tax = tx.append_entry(self.entry(
                    account_id,
                    EntryType::Tax,
                    Direction::Debit,
                    tax_withheld,
                    currency,
                    SourceType::Payout,
                    &payout_id.to_string(),
                    idempotency_key,
                    created_by,
                    now,
                    json!({ "withholding_rate": self.tax_withholding_rate }),
                ))?;
                entry_ids.push(tax.id);
            }

            payout
                .begin_processing(debit.id)
                .map_err(|e| StoreError::Invalid(e.to_string()))?;
            tx.put_payout(payout.clone())?;
            rebalance(tx, account_id, currency, now)?;
            Ok(entry_ids)
        });

        let entry_ids = match entry_ids {
            Ok(ids) => ids,
            Err(StoreError::NotFound(_)) => return Err(OpError::BalanceNotFound),
            Err(StoreError::Invalid(msg)) if msg.starts_with("insufficient:") => {
                let available = msg
                    .trim_start_matches("insufficient:")
                    .parse()
                    .unwrap_or_default();
                return Err(OpError::InsufficientFunds {
                    requested: amount,
                    available,
                });
            }
            Err(other) => return Err(other.into()),
        };

        match self
            .processor
            .create_payout(idempotency_key, account_id, payout.net_amount, currency)
        {
            Ok(receipt) => {
                if receipt.status == ProcessorStatus::Succeeded {
                    self.store.transaction(|tx| {
                        let mut stored = tx
                            .payout(payout_id)?
                            .ok_or_else(|| StoreError::NotFound(payout_id.to_string()))?;
                        stored
                            .mark_paid()
                            .map_err(|e| StoreError::Invalid(e.to_string()))?;
                        tx.put_payout(stored)
                    })?;
                }
                // Pending stays in processing until the rail confirms.
                Ok(ResultRefs {
                    ledger_entry_ids: entry_ids,
                    payout_id: Some(payout_id),
                    statement: None,
                    external_id: Some(receipt.external_id),
                })
            }
            Err(err) => {
                tracing::warn!(payout = %payout_id, error = %err, "payout transfer failed, reversing");
                self.store.transaction(|tx| {
                    let mut stored = tx
                        .payout(payout_id)?
                        .ok_or_else(|| StoreError::NotFound(payout_id.to_string()))?;
                    stored
                        .mark_failed()
                        .map_err(|e| StoreError::Invalid(e.to_string()))?;
                    tx.put_payout(stored)?;

                    let held = tx.entries_by_source(account_id, currency, &payout_id.to_string())?;
                    for entry in held {
                        if entry_ids.contains(&entry.id) {
                            tx.append_entry(entry.reversal(
                                CreatedBy::System,
                                now,
                                json!({ "reverses": entry.id }),
                            ))?;
                        }
                    }
                    rebalance(tx, account_id, currency, now)?;
                    Ok(())
                })?;
                Err(OpError::Processor(err.to_string()))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn adjustment(
        &self,
        account_id: AccountId,
        currency: &Currency,
        amount: MinorUnits,
        direction: Direction,
        reason: &str,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
    ) -> Result<ResultRefs, OpError> {
        if amount == 0 {
            return Err(OpError::Validation("adjustment amount must be positive".to_string()));
        }
        if reason.trim().is_empty() {
            return Err(OpError::Validation("adjustment requires a reason".to_string()));
        }

        let entry = self.store.transaction(|tx| {
            let entry = tx.append_entry(self.entry(
                account_id,
                EntryType::Adjustment,
                direction,
                amount,
                currency,
                SourceType::Adjustment,
                reason,
                idempotency_key,
                created_by,
                now,
                json!({ "reason": reason }),
            ))?;
            rebalance(tx, account_id, currency, now)?;
            Ok(entry)
        })?;

        Ok(ResultRefs {
            ledger_entry_ids: vec![entry.id],
            ..ResultRefs::default()
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn open_dispute(
        &self,
        account_id: AccountId,
        currency: &Currency,
        amount: MinorUnits,
        charge_reference: &str,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
    ) -> Result<ResultRefs, OpError> {
        if amount == 0 {
            return Err(OpError::Validation("dispute amount must be positive".to_string()));
        }

        let entry = self.store.transaction(|tx| {
            let related = tx.entries_by_source(account_id, currency, charge_reference)?;
            let charge_gross: MinorUnits = related
                .iter()
                .filter(|e| {
                    e.is_posted()
                        && e.entry_type == EntryType::Charge
                        && e.direction == Direction::Credit
                })
                .map(|e| e.amount)
                .sum();
            if charge_gross == 0 {
                return Err(StoreError::NotFound(format!(
                    "no settled charge for {charge_reference}"
                )));
            }
            if amount > charge_gross {
                return Err(StoreError::Invalid(format!(
                    "dispute {amount} exceeds charge gross {charge_gross}"
                )));
            }
            if open_dispute_amount(&related) > 0 {
                return Err(StoreError::Conflict(format!(
                    "charge {charge_reference} already has an open dispute"
                )));
            }

            let entry = tx.append_entry(self.entry(
                account_id,
                EntryType::DisputeOpened,
                Direction::Debit,
                amount,
                currency,
                SourceType::Dispute,
                charge_reference,
                idempotency_key,
                created_by,
                now,
                JsonValue::Null,
            ))?;
            rebalance(tx, account_id, currency, now)?;
            Ok(entry)
        });

        let entry = match entry {
            Ok(entry) => entry,
            Err(StoreError::NotFound(msg)) | Err(StoreError::Invalid(msg)) => {
                return Err(OpError::Validation(msg));
            }
            Err(other) => return Err(other.into()),
        };

        Ok(ResultRefs {
            ledger_entry_ids: vec![entry.id],
            ..ResultRefs::default()
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_dispute(
        &self,
        account_id: AccountId,
        currency: &Currency,
        charge_reference: &str,
        won: bool,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
    ) -> Result<ResultRefs, OpError> {
        let entry = self.store.transaction(|tx| {
            let related = tx.entries_by_source(account_id, currency, charge_reference)?;
            let held = open_dispute_amount(&related);
            if held == 0 {
                return Err(StoreError::NotFound(format!(
                    "no open dispute on {charge_reference}"
                )));
            }

            let (entry_type, direction) = if won {
                (EntryType::DisputeWon, Direction::Credit)
            } else {
                (EntryType::DisputeLost, Direction::Debit)
            };
            let entry = tx.append_entry(self.entry(
                account_id,
                entry_type,
                direction,
                held,
                currency,
                SourceType::Dispute,
                charge_reference,
                idempotency_key,
                created_by,
                now,
                JsonValue::Null,
            ))?;
            rebalance(tx, account_id, currency, now)?;
            Ok(entry)
        });

        let entry = match entry {
            Ok(entry) => entry,
            Err(StoreError::NotFound(msg)) => return Err(OpError::Validation(msg)),
            Err(other) => return Err(other.into()),
        };

        Ok(ResultRefs {
            ledger_entry_ids: vec![entry.id],
            ..ResultRefs::default()
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn entry(
        &self,
        account_id: AccountId,
        entry_type: EntryType,
        direction: Direction,
        amount: MinorUnits,
        currency: &Currency,
        source_type: SourceType,
        source_reference: &str,
        idempotency_key: &str,
        created_by: CreatedBy,
        now: DateTime<Utc>,
        metadata: JsonValue,
    ) -> UnpostedEntry {
        let available_at = if entry_type.settles() {
            self.settlement.available_at(now)
        } else {
            now
        };
        UnpostedEntry {
            id: EntryId::new(),
            account_id,
            entry_type,
            direction,
            amount,
            currency: currency.clone(),
            source_type,
            source_reference: source_reference.to_string(),
            status: EntryStatus::Posted,
            effective_at: now,
            available_at,
            created_by,
            metadata: stamp_key(metadata, idempotency_key),
        }
    }
}

/// Record the idempotency key on the entry, so a retry that adopts an
/// abandoned reservation can find what its dead predecessor committed.
fn stamp_key(metadata: JsonValue, idempotency_key: &str) -> JsonValue {
    let mut map = match metadata {
        JsonValue::Object(map) => map,
        JsonValue::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("detail".to_string(), other);
            map
        }
    };
    map.insert(
        "idempotency_key".to_string(),
        JsonValue::String(idempotency_key.to_string()),
    );
    JsonValue::Object(map)
}

/// Recompute and persist the balance from the full stream.
fn rebalance(
    tx: &mut dyn StoreTx,
    account_id: AccountId,
    currency: &Currency,
    now: DateTime<Utc>,
) -> Result<Balance, StoreError> {
    let entries = tx.entries(account_id, currency)?;
    let balance = Balance::fold(account_id, currency.clone(), &entries, now);
    tx.put_balance(balance.clone())?;
    Ok(balance)
}

/// (charge gross if any, remaining refundable amount) for one reference.
fn refundable_remainder(
    tx: &mut dyn StoreTx,
    account_id: AccountId,
    currency: &Currency,
    charge_reference: &str,
) -> Result<(Option<MinorUnits>, MinorUnits), StoreError> {
    let related = tx.entries_by_source(account_id, currency, charge_reference)?;
    let gross: MinorUnits = related
        .iter()
        .filter(|e| {
            e.is_posted() && e.entry_type == EntryType::Charge && e.direction == Direction::Credit
        })
        .map(|e| e.amount)
        .sum();
    if gross == 0 {
        return Ok((None, 0));
    }
    let refunded: MinorUnits = related
        .iter()
        .filter(|e| {
            e.is_posted() && e.entry_type == EntryType::Refund && e.direction == Direction::Debit
        })
        .map(|e| e.amount)
        .sum();
    Ok((Some(gross), gross.saturating_sub(refunded)))
}

/// Net dispute hold currently standing against one reference.
fn open_dispute_amount(related: &[LedgerEntry]) -> MinorUnits {
    let mut held = 0i64;
    for entry in related {
        if !entry.is_posted() {
            continue;
        }
        match entry.entry_type {
            EntryType::DisputeOpened => held += entry.amount as i64,
            EntryType::DisputeWon | EntryType::DisputeLost => held -= entry.amount as i64,
            _ => {}
        }
    }
    held.max(0) as MinorUnits
}

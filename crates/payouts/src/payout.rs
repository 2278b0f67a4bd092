use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marketpay_core::{AccountId, Currency, DomainError, EntryId, MinorUnits, PayoutId};

/// Payout lifecycle.
///
/// pending → processing → paid | failed; paid → reversed; pending → canceled.
/// Once a transition commits it is permanent — "cancel" and "reverse" are
/// forward transitions (with their own ledger entries), never in-place undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Paid,
    Failed,
    Reversed,
    Canceled,
}

impl PayoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PayoutStatus::Paid
                | PayoutStatus::Failed
                | PayoutStatus::Reversed
                | PayoutStatus::Canceled
        )
    }
}

/// One payout of an account's available funds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: PayoutId,
    pub account_id: AccountId,
    /// Gross amount debited from the account.
    pub amount: MinorUnits,
    /// What the account holder receives after fee and withholding.
    pub net_amount: MinorUnits,
    pub fee: MinorUnits,
    pub tax_withheld: MinorUnits,
    pub currency: Currency,
    pub status: PayoutStatus,
    pub settlement_date: DateTime<Utc>,
    /// The single debit ledger entry this payout corresponds to (1:1).
    pub ledger_entry_id: Option<EntryId>,
    /// Worker lock: which process is driving this payout, and since when.
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Approval audit trail (admin-approved manual payouts).
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payout {
    pub fn new(
        account_id: AccountId,
        amount: MinorUnits,
        fee: MinorUnits,
        tax_withheld: MinorUnits,
        currency: Currency,
        settlement_date: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PayoutId::new(),
            account_id,
            amount,
            net_amount: amount.saturating_sub(fee).saturating_sub(tax_withheld),
            fee,
            tax_withheld,
            currency,
            status: PayoutStatus::Pending,
            settlement_date,
            ledger_entry_id: None,
            locked_by: None,
            locked_at: None,
            approved_by: None,
            approved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, from: &[PayoutStatus], to: PayoutStatus) -> Result<(), DomainError> {
        if !from.contains(&self.status) {
            return Err(DomainError::conflict(format!(
                "payout {} cannot move {:?} -> {to:?}",
                self.id, self.status
            )));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Attach the 1:1 debit entry and hand the payout to the processor.
    pub fn begin_processing(&mut self, entry_id: EntryId) -> Result<(), DomainError> {
        self.transition(&[PayoutStatus::Pending], PayoutStatus::Processing)?;
        self.ledger_entry_id = Some(entry_id);
        Ok(())
    }

    pub fn mark_paid(&mut self) -> Result<(), DomainError> {
        self.transition(&[PayoutStatus::Processing], PayoutStatus::Paid)
    }

    pub fn mark_failed(&mut self) -> Result<(), DomainError> {
        self.transition(&[PayoutStatus::Processing], PayoutStatus::Failed)
    }

    /// The rail clawed back a paid payout.
    pub fn mark_reversed(&mut self) -> Result<(), DomainError> {
        self.transition(&[PayoutStatus::Paid], PayoutStatus::Reversed)
    }

    pub fn cancel(&mut self) -> Result<(), DomainError> {
        self.transition(&[PayoutStatus::Pending], PayoutStatus::Canceled)
    }

    pub fn approve(&mut self, admin: impl Into<String>) {
        self.approved_by = Some(admin.into());
        self.approved_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    pub fn lock(&mut self, worker: impl Into<String>) {
        self.locked_by = Some(worker.into());
        self.locked_at = Some(Utc::now());
    }

    pub fn unlock(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }
}

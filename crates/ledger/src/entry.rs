use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketpay_core::{AccountId, CreatedBy, Currency, DomainError, EntryId, MinorUnits};

/// Kind of monetary movement an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Charge,
    Refund,
    Fee,
    Payout,
    DisputeOpened,
    DisputeWon,
    DisputeLost,
    Adjustment,
    Tax,
}

impl EntryType {
    /// Whether funds of this type sit in `pending` until the settlement
    /// window elapses. Payouts, adjustments and tax withholding take effect
    /// immediately; dispute entries move the reserved bucket instead.
    pub fn settles(&self) -> bool {
        matches!(self, EntryType::Charge | EntryType::Refund | EntryType::Fee)
    }

    pub fn is_dispute(&self) -> bool {
        matches!(
            self,
            EntryType::DisputeOpened | EntryType::DisputeWon | EntryType::DisputeLost
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Charge => "charge",
            EntryType::Refund => "refund",
            EntryType::Fee => "fee",
            EntryType::Payout => "payout",
            EntryType::DisputeOpened => "dispute_opened",
            EntryType::DisputeWon => "dispute_won",
            EntryType::DisputeLost => "dispute_lost",
            EntryType::Adjustment => "adjustment",
            EntryType::Tax => "tax",
        }
    }
}

/// Side of the movement relative to the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn inverse(&self) -> Self {
        match self {
            Direction::Credit => Direction::Debit,
            Direction::Debit => Direction::Credit,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

/// Entries are never deleted; a voided entry stays in the log but is skipped
/// by the balance fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Posted,
    Voided,
}

/// What domain record an entry points back to (polymorphic reference).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Order,
    Invoice,
    Refund,
    Payout,
    Dispute,
    Subscription,
    Adjustment,
    Statement,
    Manual,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Order => "order",
            SourceType::Invoice => "invoice",
            SourceType::Refund => "refund",
            SourceType::Payout => "payout",
            SourceType::Dispute => "dispute",
            SourceType::Subscription => "subscription",
            SourceType::Adjustment => "adjustment",
            SourceType::Statement => "statement",
            SourceType::Manual => "manual",
        }
    }
}

/// An entry ready to be appended but not yet assigned its insertion sequence.
///
/// The ledger store assigns the `sequence` during append; within one
/// (account, currency) stream entries are ordered by `effective_at` and
/// tie-broken by that sequence, which is what makes replay deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpostedEntry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub direction: Direction,
    /// Non-negative amount in minor currency units.
    pub amount: MinorUnits,
    pub currency: Currency,
    pub source_type: SourceType,
    pub source_reference: String,
    pub status: EntryStatus,
    pub effective_at: DateTime<Utc>,
    /// When the funds become withdrawable: `effective_at` plus the settlement
    /// delay for settling types, equal to `effective_at` otherwise.
    pub available_at: DateTime<Utc>,
    pub created_by: CreatedBy,
    pub metadata: JsonValue,
}

impl UnpostedEntry {
    /// Validate invariants that must hold before an entry may be appended.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.source_reference.is_empty() {
            return Err(DomainError::validation("source_reference must not be empty"));
        }
        if self.available_at < self.effective_at {
            return Err(DomainError::invariant(
                "available_at must not precede effective_at",
            ));
        }
        if !self.entry_type.settles() && self.available_at != self.effective_at {
            return Err(DomainError::invariant(
                "non-settling entry types carry no settlement delay",
            ));
        }
        Ok(())
    }

    /// Attach the store-assigned insertion sequence, producing the immutable
    /// posted form.
    pub fn into_posted(self, sequence: u64) -> LedgerEntry {
        LedgerEntry {
            id: self.id,
            account_id: self.account_id,
            entry_type: self.entry_type,
            direction: self.direction,
            amount: self.amount,
            currency: self.currency,
            source_type: self.source_type,
            source_reference: self.source_reference,
            status: self.status,
            effective_at: self.effective_at,
            available_at: self.available_at,
            created_by: self.created_by,
            metadata: self.metadata,
            sequence,
        }
    }
}

/// An immutable, appended ledger entry.
///
/// Never mutated post-creation; reversals are new, inverse-signed entries
/// (see [`LedgerEntry::reversal`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub direction: Direction,
    pub amount: MinorUnits,
    pub currency: Currency,
    pub source_type: SourceType,
    pub source_reference: String,
    pub status: EntryStatus,
    pub effective_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub created_by: CreatedBy,
    pub metadata: JsonValue,
    /// Store-assigned insertion order within the (account, currency) stream.
    pub sequence: u64,
}

impl LedgerEntry {
    pub fn is_posted(&self) -> bool {
        self.status == EntryStatus::Posted
    }

    /// Signed contribution of this entry to the account total.
    ///
    /// Credits are positive, debits negative. `dispute_lost` contributes
    /// zero: its effect on the total was already taken when the hold was
    /// placed at `dispute_opened` (the lost amount converts the hold into a
    /// permanent deduction without moving the total again).
    pub fn signed_amount(&self) -> i64 {
        if self.entry_type == EntryType::DisputeLost {
            return 0;
        }
        match self.direction {
            Direction::Credit => self.amount as i64,
            Direction::Debit => -(self.amount as i64),
        }
    }

    /// Build an inverse-signed entry that undoes this one.
    ///
    /// The reversal is a fresh entry (new id, immediate availability); the
    /// original is never touched.
    pub fn reversal(
        &self,
        created_by: CreatedBy,
        effective_at: DateTime<Utc>,
        metadata: JsonValue,
    ) -> UnpostedEntry {
        UnpostedEntry {
            id: EntryId::new(),
            account_id: self.account_id,
            entry_type: self.entry_type,
            direction: self.direction.inverse(),
            amount: self.amount,
            currency: self.currency.clone(),
            source_type: self.source_type,
            source_reference: self.source_reference.clone(),
            status: EntryStatus::Posted,
            effective_at,
            available_at: effective_at,
            created_by,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(entry_type: EntryType, direction: Direction, amount: u64) -> LedgerEntry {
        let now = Utc::now();
        LedgerEntry {
            id: EntryId::new(),
            account_id: AccountId::new(),
            entry_type,
            direction,
            amount,
            currency: Currency::usd(),
            source_type: SourceType::Manual,
            source_reference: "test".to_string(),
            status: EntryStatus::Posted,
            effective_at: now,
            available_at: now,
            created_by: CreatedBy::System,
            metadata: JsonValue::Null,
            sequence: 1,
        }
    }

    #[test]
    fn signed_amount_follows_direction() {
        assert_eq!(entry(EntryType::Charge, Direction::Credit, 500).signed_amount(), 500);
        assert_eq!(entry(EntryType::Fee, Direction::Debit, 30).signed_amount(), -30);
    }

    #[test]
    fn dispute_lost_is_signed_zero() {
        assert_eq!(
            entry(EntryType::DisputeLost, Direction::Debit, 1000).signed_amount(),
            0
        );
    }

    #[test]
    fn reversal_flips_direction_and_mints_new_id() {
        let original = entry(EntryType::Payout, Direction::Debit, 9680);
        let reversal = original.reversal(CreatedBy::System, Utc::now(), JsonValue::Null);

        assert_eq!(reversal.direction, Direction::Credit);
        assert_eq!(reversal.amount, original.amount);
        assert_ne!(reversal.id, original.id);
        assert_eq!(reversal.source_reference, original.source_reference);
    }

    #[test]
    fn validate_rejects_delay_on_non_settling_types() {
        let now = Utc::now();
        let bad = UnpostedEntry {
            id: EntryId::new(),
            account_id: AccountId::new(),
            entry_type: EntryType::Payout,
            direction: Direction::Debit,
            amount: 100,
            currency: Currency::usd(),
            source_type: SourceType::Payout,
            source_reference: "p".to_string(),
            status: EntryStatus::Posted,
            effective_at: now,
            available_at: now + chrono::Duration::days(7),
            created_by: CreatedBy::System,
            metadata: JsonValue::Null,
        };
        assert!(bad.validate().is_err());
    }
}

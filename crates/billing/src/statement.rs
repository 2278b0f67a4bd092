//! Monthly statement rollup.
//!
//! A statement aggregates one calendar month of an account's ledger into
//! immutable totals. Once finalized it is never regenerated; the store
//! enforces uniqueness on (account, year, month, currency).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use marketpay_core::{AccountId, Currency, DomainError};
use marketpay_ledger::{Direction, EntryType, LedgerEntry};

/// A calendar month in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatementPeriod {
    pub year: i32,
    /// 1-based month.
    pub month: u32,
}

impl StatementPeriod {
    pub fn new(year: i32, month: u32) -> Result<Self, DomainError> {
        if !(1..=12).contains(&month) {
            return Err(DomainError::validation(format!("invalid month: {month}")));
        }
        Ok(Self { year, month })
    }

    /// The month containing `at`.
    pub fn containing(at: DateTime<Utc>) -> Self {
        use chrono::Datelike;
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    /// The month before this one.
    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self { year: self.year - 1, month: 12 }
        } else {
            Self { year: self.year, month: self.month - 1 }
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .expect("first day of month is always valid")
    }

    pub fn end(&self) -> DateTime<Utc> {
        let (year, month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
            .single()
            .expect("first day of month is always valid")
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start() && at < self.end()
    }
}

impl core::fmt::Display for StatementPeriod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Immutable per-month rollup of one account's ledger activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub account_id: AccountId,
    pub period: StatementPeriod,
    pub currency: Currency,
    /// Charge credits posted this period.
    pub gross: i64,
    /// Refund debits (positive number).
    pub refunds: i64,
    /// Net dispute movement (signed).
    pub disputes: i64,
    /// Fee debits net of fee reversals (positive number).
    pub fees: i64,
    /// Payout debits (positive number).
    pub payouts: i64,
    /// Signed sum of every posted entry in the period.
    pub net: i64,
    /// Tax sub-summary: withholding debits this period.
    pub tax_withheld: i64,
    pub entry_count: u32,
    pub finalized_at: DateTime<Utc>,
}

impl Statement {
    /// Roll up the period's entries into immutable totals.
    ///
    /// Entries outside the period or voided entries are ignored, so callers
    /// may pass the full account history.
    pub fn rollup<'a>(
        account_id: AccountId,
        period: StatementPeriod,
        currency: Currency,
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
        finalized_at: DateTime<Utc>,
    ) -> Self {
        let mut statement = Self {
            account_id,
            period,
            currency,
            gross: 0,
            refunds: 0,
            disputes: 0,
            fees: 0,
            payouts: 0,
            net: 0,
            tax_withheld: 0,
            entry_count: 0,
            finalized_at,
        };

        for entry in entries {
            if !entry.is_posted() || !period.contains(entry.effective_at) {
                continue;
            }
            statement.entry_count += 1;
            statement.net += entry.signed_amount();

            let amount = entry.amount as i64;
            match (entry.entry_type, entry.direction) {
                (EntryType::Charge, Direction::Credit) => statement.gross += amount,
                (EntryType::Charge, Direction::Debit) => statement.gross -= amount,
                (EntryType::Refund, Direction::Debit) => statement.refunds += amount,
                (EntryType::Refund, Direction::Credit) => statement.refunds -= amount,
                (EntryType::Fee, Direction::Debit) => statement.fees += amount,
                (EntryType::Fee, Direction::Credit) => statement.fees -= amount,
                (EntryType::Payout, Direction::Debit) => statement.payouts += amount,
                (EntryType::Payout, Direction::Credit) => statement.payouts -= amount,
                (EntryType::Tax, Direction::Debit) => statement.tax_withheld += amount,
                (EntryType::Tax, Direction::Credit) => statement.tax_withheld -= amount,
                (t, _) if t.is_dispute() => statement.disputes += entry.signed_amount(),
                _ => {}
            }
        }

        statement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use marketpay_core::{CreatedBy, EntryId};
    use marketpay_ledger::{EntryStatus, SourceType};
    use serde_json::Value as JsonValue;

    fn entry(
        account: AccountId,
        entry_type: EntryType,
        direction: Direction,
        amount: u64,
        effective_at: DateTime<Utc>,
    ) -> LedgerEntry {
        LedgerEntry {
            id: EntryId::new(),
            account_id: account,
            entry_type,
            direction,
            amount,
            currency: Currency::usd(),
            source_type: SourceType::Manual,
            source_reference: "s".to_string(),
            status: EntryStatus::Posted,
            effective_at,
            available_at: effective_at,
            created_by: CreatedBy::Cron,
            metadata: JsonValue::Null,
            sequence: 1,
        }
    }

    #[test]
    fn period_boundaries_are_half_open() {
        let period = StatementPeriod::new(2026, 7).unwrap();
        assert!(period.contains(period.start()));
        assert!(!period.contains(period.end()));
        assert_eq!(period.end(), StatementPeriod::new(2026, 8).unwrap().start());
    }

    #[test]
    fn december_rolls_into_january() {
        let period = StatementPeriod::new(2026, 12).unwrap();
        assert_eq!(period.end(), StatementPeriod::new(2027, 1).unwrap().start());
        assert_eq!(period.previous(), StatementPeriod::new(2026, 11).unwrap());
        assert_eq!(
            StatementPeriod::new(2027, 1).unwrap().previous(),
            StatementPeriod::new(2026, 12).unwrap()
        );
    }

    #[test]
    fn rollup_buckets_by_entry_type_and_skips_out_of_period() {
        let account = AccountId::new();
        let period = StatementPeriod::new(2026, 7).unwrap();
        let inside = period.start() + Duration::days(10);

        let entries = vec![
            entry(account, EntryType::Charge, Direction::Credit, 10_000, inside),
            entry(account, EntryType::Fee, Direction::Debit, 420, inside),
            entry(account, EntryType::Refund, Direction::Debit, 1_000, inside),
            entry(account, EntryType::Fee, Direction::Credit, 42, inside),
            entry(account, EntryType::Payout, Direction::Debit, 5_000, inside),
            entry(account, EntryType::Tax, Direction::Debit, 300, inside),
            // outside the period
            entry(account, EntryType::Charge, Direction::Credit, 99_999, period.end()),
        ];

        let s = Statement::rollup(account, period, Currency::usd(), &entries, Utc::now());
        assert_eq!(s.gross, 10_000);
        assert_eq!(s.refunds, 1_000);
        assert_eq!(s.fees, 420 - 42);
        assert_eq!(s.payouts, 5_000);
        assert_eq!(s.tax_withheld, 300);
        assert_eq!(s.entry_count, 6);
        assert_eq!(s.net, 10_000 - 420 - 1_000 + 42 - 5_000 - 300);
    }
}

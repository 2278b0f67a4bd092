use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use marketpay_core::{AccountId, Currency, CustomerId, MinorUnits, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    /// Next billing instant after `from`. Months clamp the day-of-month
    /// (Jan 31 + 1 month bills Feb 28/29).
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BillingInterval::Monthly => add_months(from, 1),
            BillingInterval::Yearly => add_months(from, 12),
        }
    }
}

fn add_months(from: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let total = from.year() * 12 + from.month0() as i32 + months as i32;
    let year = total.div_euclid(12);
    let month0 = total.rem_euclid(12) as u32;
    let day = from.day().min(days_in_month(year, month0 + 1));
    Utc.with_ymd_and_hms(year, month0 + 1, day, from.hour(), from.minute(), from.second())
        .single()
        .unwrap_or(from + Duration::days(30 * months as i64))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_next = Utc.with_ymd_and_hms(ny, nm, 1, 0, 0, 0).single();
    let first_this = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single();
    match (first_this, first_next) {
        (Some(a), Some(b)) => (b - a).num_days() as u32,
        _ => 28,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
}

/// A recurring billing agreement between a customer and an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub account_id: AccountId,
    pub customer_id: CustomerId,
    pub amount: MinorUnits,
    pub currency: Currency,
    pub interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub next_billing_at: DateTime<Utc>,
    pub cycle_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        account_id: AccountId,
        customer_id: CustomerId,
        amount: MinorUnits,
        currency: Currency,
        interval: BillingInterval,
        first_billing_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::new(),
            account_id,
            customer_id,
            amount,
            currency,
            interval,
            status: SubscriptionStatus::Active,
            next_billing_at: first_billing_at,
            cycle_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the billing driver should pick this subscription up.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::PastDue
        ) && self.next_billing_at <= now
    }

    /// Successful billing: advance the cycle and recover from past_due.
    pub fn advance_cycle(&mut self) {
        self.next_billing_at = self.interval.advance(self.next_billing_at);
        self.cycle_count += 1;
        self.status = SubscriptionStatus::Active;
        self.updated_at = Utc::now();
    }

    /// Processor declined: flag without touching any balance.
    pub fn mark_past_due(&mut self) {
        if self.status == SubscriptionStatus::Active {
            self.status = SubscriptionStatus::PastDue;
        }
        self.updated_at = Utc::now();
    }

    pub fn cancel(&mut self) {
        self.status = SubscriptionStatus::Canceled;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(first: DateTime<Utc>) -> Subscription {
        Subscription::new(
            AccountId::new(),
            CustomerId::new(),
            2_500,
            Currency::usd(),
            BillingInterval::Monthly,
            first,
        )
    }

    #[test]
    fn due_when_next_billing_passed_and_not_canceled() {
        let now = Utc::now();
        let mut s = sub(now - Duration::hours(1));
        assert!(s.is_due(now));

        s.mark_past_due();
        assert!(s.is_due(now));

        s.cancel();
        assert!(!s.is_due(now));
    }

    #[test]
    fn advance_cycle_moves_anchor_and_recovers_past_due() {
        let first = Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap();
        let mut s = sub(first);
        s.mark_past_due();
        s.advance_cycle();

        assert_eq!(s.cycle_count, 1);
        assert_eq!(s.status, SubscriptionStatus::Active);
        assert_eq!(s.next_billing_at, Utc.with_ymd_and_hms(2026, 2, 15, 9, 0, 0).unwrap());
    }

    #[test]
    fn monthly_advance_clamps_short_months() {
        let jan31 = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        assert_eq!(
            BillingInterval::Monthly.advance(jan31),
            Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn yearly_advance() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            BillingInterval::Yearly.advance(t),
            Utc.with_ymd_and_hms(2027, 3, 1, 12, 0, 0).unwrap()
        );
    }
}

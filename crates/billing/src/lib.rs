//! `marketpay-billing` — subscription cycles and monthly statement rollups.

pub mod statement;
pub mod subscription;

pub use statement::{Statement, StatementPeriod};
pub use subscription::{BillingInterval, Subscription, SubscriptionStatus};

//! `marketpay-payouts` — the payout record and its status machine.

pub mod payout;

pub use payout::{Payout, PayoutStatus};

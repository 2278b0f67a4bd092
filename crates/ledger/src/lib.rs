//! `marketpay-ledger` — the immutable ledger entry model and the rules that
//! derive balances from it.
//!
//! Nothing here performs IO. Stores live in `marketpay-infra`; this crate
//! defines what an entry *is* and how a sequence of entries folds into a
//! balance snapshot.

pub mod balance;
pub mod entry;
pub mod fees;
pub mod settlement;

pub use balance::Balance;
pub use entry::{
    Direction, EntryStatus, EntryType, LedgerEntry, SourceType, UnpostedEntry,
};
pub use fees::{FeeBreakdown, FeePolicy};
pub use settlement::{AccountSubtotal, SettlementBatch, SettlementPolicy};

//! `marketpay-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod actor;
pub mod error;
pub mod id;
pub mod money;

pub use actor::CreatedBy;
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, BatchId, CustomerId, EntryId, PayoutId, SubscriptionId};
pub use money::{Currency, MinorUnits};

//! Actor provenance for audit trails.

use serde::{Deserialize, Serialize};

/// Who (or what) caused a record to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedBy {
    System,
    Cron,
    Admin,
    AccountHolder,
    Api,
}

impl CreatedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreatedBy::System => "system",
            CreatedBy::Cron => "cron",
            CreatedBy::Admin => "admin",
            CreatedBy::AccountHolder => "account_holder",
            CreatedBy::Api => "api",
        }
    }
}

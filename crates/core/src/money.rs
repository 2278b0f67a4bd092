//! Monetary primitives.
//!
//! All persisted amounts are non-negative integers in minor currency units
//! (cents for usd). Sign is carried separately by an entry's direction.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A non-negative amount in minor currency units.
pub type MinorUnits = u64;

/// Lowercase ISO-4217 currency code (e.g. "usd", "eur").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    /// Parse and normalize a currency code.
    ///
    /// Accepts any case, stores lowercase. Rejects anything that is not
    /// exactly three ASCII letters.
    pub fn new(code: impl AsRef<str>) -> Result<Self, DomainError> {
        let code = code.as_ref();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(format!(
                "invalid currency code: {code:?}"
            )));
        }
        Ok(Self(code.to_ascii_lowercase()))
    }

    /// US dollars, the default marketplace currency.
    pub fn usd() -> Self {
        Self("usd".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

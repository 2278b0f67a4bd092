//! Fee assessment and refund reversal arithmetic.

use serde::{Deserialize, Serialize};

use marketpay_core::MinorUnits;

/// Fee rates applied when a charge settles into an account.
///
/// Defaults mirror the standard card-rail pricing: processor takes
/// 2.9% + 30 minor units, the platform takes 1%.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub processor_rate: f64,
    pub processor_fixed: MinorUnits,
    pub platform_rate: f64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            processor_rate: 0.029,
            processor_fixed: 30,
            platform_rate: 0.01,
        }
    }
}

impl FeePolicy {
    /// A policy with no platform cut (processor fee only).
    pub fn processor_only() -> Self {
        Self {
            platform_rate: 0.0,
            ..Self::default()
        }
    }

    /// Assess fees on a gross charge amount.
    pub fn assess(&self, gross: MinorUnits) -> FeeBreakdown {
        let processor_fee =
            (gross as f64 * self.processor_rate).round() as MinorUnits + self.processor_fixed;
        let platform_fee = (gross as f64 * self.platform_rate).round() as MinorUnits;
        FeeBreakdown {
            gross,
            processor_fee,
            platform_fee,
        }
    }

    /// Fees to hand back when `refund_gross` of the original charge is
    /// refunded. Proportional to the refunded share, rounded per component;
    /// a full refund returns the original fees exactly.
    pub fn refund_reversal(
        &self,
        original: &FeeBreakdown,
        refund_gross: MinorUnits,
    ) -> FeeBreakdown {
        debug_assert!(refund_gross <= original.gross);
        if refund_gross == original.gross {
            return original.clone();
        }
        let share = refund_gross as f64 / original.gross as f64;
        FeeBreakdown {
            gross: refund_gross,
            processor_fee: (original.processor_fee as f64 * share).round() as MinorUnits,
            platform_fee: (original.platform_fee as f64 * share).round() as MinorUnits,
        }
    }
}

/// The fee split of one charge (or one refund reversal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub gross: MinorUnits,
    pub processor_fee: MinorUnits,
    pub platform_fee: MinorUnits,
}

impl FeeBreakdown {
    pub fn total_fees(&self) -> MinorUnits {
        self.processor_fee + self.platform_fee
    }

    pub fn net(&self) -> MinorUnits {
        self.gross.saturating_sub(self.total_fees())
    }
}

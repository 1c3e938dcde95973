// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Daily yield bands keyed by total invested amount.

use crate::error::{SettlementError, SettlementResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance above which accrual stops growing the balance.
pub const BALANCE_CAP_USD: Decimal = Decimal::from_parts(500_000, 0, 0, false, 0);

/// One band `[min_amount, max_amount] -> daily_rate` (percent).
/// `max_amount` is open-ended when absent; only the last band may omit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct YieldTier {
    pub min_amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Decimal>,
    pub daily_rate: Decimal,
}

impl YieldTier {
    pub fn new(min_amount: Decimal, max_amount: Option<Decimal>, daily_rate: Decimal) -> Self {
        Self {
            min_amount,
            max_amount,
            daily_rate,
        }
    }

    pub fn contains(&self, amount: Decimal) -> bool {
        self.min_amount <= amount && !matches!(self.max_amount, Some(max) if amount > max)
    }
}

/// Ordered, non-overlapping yield bands. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct YieldTierTable {
    tiers: Vec<YieldTier>,
}

impl YieldTierTable {
    pub fn new(tiers: Vec<YieldTier>) -> SettlementResult<Self> {
        for (idx, tier) in tiers.iter().enumerate() {
            if tier.min_amount.is_sign_negative() || tier.daily_rate.is_sign_negative() {
                return Err(SettlementError::Config(format!(
                    "yield tier {} has a negative bound or rate",
                    idx
                )));
            }
            match tier.max_amount {
                Some(max) if max < tier.min_amount => {
                    return Err(SettlementError::Config(format!(
                        "yield tier {} has max {} below min {}",
                        idx, max, tier.min_amount
                    )));
                }
                None if idx + 1 != tiers.len() => {
                    return Err(SettlementError::Config(format!(
                        "yield tier {} is open-ended but is not the last band",
                        idx
                    )));
                }
                _ => {}
            }
            if let Some(prev) = idx.checked_sub(1).map(|i| &tiers[i]) {
                // `prev.max_amount` is Some here: only the last band may be open-ended
                let prev_max = prev.max_amount.unwrap_or(Decimal::MAX);
                if tier.min_amount <= prev_max {
                    return Err(SettlementError::Config(format!(
                        "yield tier {} (min {}) overlaps or precedes tier {} (max {})",
                        idx,
                        tier.min_amount,
                        idx - 1,
                        prev_max
                    )));
                }
            }
        }
        Ok(Self { tiers })
    }

    /// Daily rate of the band containing `total_invested`, bounds inclusive.
    ///
    /// Zero outside every band: below the first, between two bands, and past
    /// a closed last band.
    pub fn rate_for(&self, total_invested: Decimal) -> Decimal {
        self.tiers
            .iter()
            .find(|tier| tier.contains(total_invested))
            .map(|tier| tier.daily_rate)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn tiers(&self) -> &[YieldTier] {
        &self.tiers
    }
}

impl Default for YieldTierTable {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

pub fn default_tiers() -> Vec<YieldTier> {
    let bands: [(i64, Option<i64>, i64); 15] = [
        (100, Some(500), 15),
        (600, Some(1_000), 25),
        (1_001, Some(2_000), 35),
        (2_001, Some(3_000), 45),
        (3_001, Some(4_000), 55),
        (4_001, Some(5_000), 65),
        (5_001, Some(10_000), 75),
        (10_001, Some(20_000), 85),
        (20_001, Some(30_000), 95),
        (30_001, Some(40_000), 105),
        (40_001, Some(50_000), 115),
        (50_001, Some(100_000), 125),
        (100_001, Some(250_000), 135),
        (250_001, Some(500_000), 145),
        (500_001, None, 150),
    ];
    bands
        .into_iter()
        .map(|(min, max, rate_tenths)| {
            YieldTier::new(
                Decimal::from(min),
                max.map(Decimal::from),
                Decimal::new(rate_tenths, 1),
            )
        })
        .collect()
}

/// One day of accrual for `balance` at `daily_rate` percent, capped so the
/// balance never grows past [`BALANCE_CAP_USD`].
///
/// Used by the downstream accrual job; settlement never calls it.
pub fn yield_growth(balance: Decimal, daily_rate: Decimal) -> Decimal {
    if balance >= BALANCE_CAP_USD || balance.is_sign_negative() {
        return Decimal::ZERO;
    }
    let grown = balance + balance * daily_rate / Decimal::ONE_HUNDRED;
    (grown.min(BALANCE_CAP_USD) - balance).round_dp(2)
}

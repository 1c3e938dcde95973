// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Records owned by the funding ledger: requests, chain events and the
//! per-user financial slice the pipeline is allowed to credit.

use crate::utils::{normalize_address, now_ms};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Deposit currency
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Currency {
    Btc,
    Eth,
    Bnb,
    Usdt,
    Usdc,
}

impl Currency {
    /// Decimal exponent of the chain-native smallest unit
    /// (satoshi for BTC, wei for ETH/BNB, token base units for stablecoins).
    pub fn default_decimals(&self) -> u32 {
        match self {
            Currency::Btc => 8,
            Currency::Eth | Currency::Bnb => 18,
            Currency::Usdt | Currency::Usdc => 6,
        }
    }

    pub fn default_required_confirmations(&self) -> u64 {
        match self {
            Currency::Btc => 1,
            Currency::Eth | Currency::Usdt | Currency::Usdc => 12,
            Currency::Bnb => 15,
        }
    }

    /// Average block interval, used by the simulated confirmation feed.
    pub fn default_block_time_secs(&self) -> u64 {
        match self {
            Currency::Btc => 600,
            Currency::Eth | Currency::Usdt | Currency::Usdc => 12,
            Currency::Bnb => 3,
        }
    }
}

/// Lifecycle of a funding request
///
/// `pending -> chain_observed -> confirmed -> settled`, with `failed`
/// reachable from `pending` and `chain_observed`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::EnumString,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FundingStatus {
    Pending,
    ChainObserved,
    Confirmed,
    Settled,
    Failed,
}

impl FundingStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FundingStatus::Settled | FundingStatus::Failed)
    }

    /// Statuses the Reaper keeps looking at.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: FundingStatus) -> bool {
        use FundingStatus::*;
        matches!(
            (self, next),
            (Pending, ChainObserved)
                | (Pending, Failed)
                | (ChainObserved, Confirmed)
                | (ChainObserved, Failed)
                | (Confirmed, Settled)
        )
    }
}

impl fmt::Display for FundingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's declared intent to deposit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRequest {
    pub id: u64,
    pub user_id: u64,
    pub currency: Currency,
    pub expected_usd: Decimal,
    pub wallet_address: String,
    pub observed_chain_hash: Option<String>,
    pub observed_confirmations: u64,
    pub observed_block_number: Option<u64>,
    pub required_confirmations: u64,
    /// Validated USD value of the observed transfer, credited on settlement
    pub actual_usd: Option<Decimal>,
    pub status: FundingStatus,
    pub failure_reason: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl FundingRequest {
    pub fn has_enough_confirmations(&self) -> bool {
        self.observed_confirmations >= self.required_confirmations
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }
}

/// Input of `FundingStore::create`
#[derive(Debug, Clone, PartialEq)]
pub struct NewFundingRequest {
    pub user_id: u64,
    pub currency: Currency,
    pub expected_usd: Decimal,
    pub wallet_address: String,
    pub required_confirmations: u64,
    pub created_at_ms: u64,
}

impl NewFundingRequest {
    pub fn new(
        user_id: u64,
        currency: Currency,
        expected_usd: Decimal,
        wallet_address: &str,
        required_confirmations: u64,
    ) -> Self {
        Self {
            user_id,
            currency,
            expected_usd,
            wallet_address: normalize_address(wallet_address),
            required_confirmations,
            created_at_ms: now_ms(),
        }
    }

    pub fn with_created_at(mut self, created_at_ms: u64) -> Self {
        self.created_at_ms = created_at_ms;
        self
    }

    pub(crate) fn into_request(self, id: u64) -> FundingRequest {
        FundingRequest {
            id,
            user_id: self.user_id,
            currency: self.currency,
            expected_usd: self.expected_usd,
            wallet_address: self.wallet_address,
            observed_chain_hash: None,
            observed_confirmations: 0,
            observed_block_number: None,
            required_confirmations: self.required_confirmations,
            actual_usd: None,
            status: FundingStatus::Pending,
            failure_reason: None,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.created_at_ms,
        }
    }
}

/// What the state machine records when a transfer is accepted
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub chain_hash: String,
    pub confirmations: u64,
    pub block_number: Option<u64>,
    pub actual_usd: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObserveOutcome {
    Observed(FundingRequest),
    /// The request left `pending` before this caller got to it
    StatusMismatch(FundingStatus),
    /// The chain hash already belongs to another request
    HashTaken(u64),
}

/// The financial slice of a user the pipeline may credit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLedger {
    pub user_id: u64,
    pub total_invested: Decimal,
    pub current_balance: Decimal,
    /// Daily yield in percent
    pub daily_yield_rate: Decimal,
    pub last_yield_update_ms: Option<u64>,
}

impl UserLedger {
    pub fn empty(user_id: u64) -> Self {
        Self {
            user_id,
            total_invested: Decimal::ZERO,
            current_balance: Decimal::ZERO,
            daily_yield_rate: Decimal::ZERO,
            last_yield_update_ms: None,
        }
    }
}

/// Result of a committed settlement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settlement {
    pub request_id: u64,
    pub user_id: u64,
    pub currency: Currency,
    pub chain_hash: Option<String>,
    pub credited_usd: Decimal,
    pub ledger: UserLedger,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Settled(Settlement),
    /// CAS lost: the request was not `confirmed`; nothing was mutated
    NotSettled(FundingStatus),
}

/// A normalized report of a value transfer to a monitored wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChainEvent {
    pub transaction_hash: String,
    pub from_address: String,
    pub to_address: String,
    /// Integer amount in chain-native units
    pub raw_value: String,
    pub symbol: Currency,
    pub confirmations: u64,
    pub block_number: Option<u64>,
    pub observed_at_ms: u64,
}

impl fmt::Display for ChainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({} units to {}, {} confirmations)",
            self.symbol,
            self.transaction_hash,
            self.raw_value,
            self.to_address,
            self.confirmations
        )
    }
}

impl FromStr for Currency {
    type Err = strum::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Currency as strum::IntoEnumIterator>::iter()
            .find(|c| c.as_ref().eq_ignore_ascii_case(s.trim()))
            .ok_or(strum::ParseError::VariantNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_transitions() {
        use FundingStatus::*;
        assert!(Pending.can_transition_to(ChainObserved));
        assert!(Pending.can_transition_to(Failed));
        assert!(ChainObserved.can_transition_to(Confirmed));
        assert!(ChainObserved.can_transition_to(Failed));
        assert!(Confirmed.can_transition_to(Settled));

        // no skipping, no going back, nothing leaves a terminal state
        assert!(!Pending.can_transition_to(Settled));
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!ChainObserved.can_transition_to(Pending));
        for next in [Pending, ChainObserved, Confirmed, Settled, Failed] {
            assert!(!Settled.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            FundingStatus::Pending,
            FundingStatus::ChainObserved,
            FundingStatus::Confirmed,
            FundingStatus::Settled,
            FundingStatus::Failed,
        ] {
            assert_eq!(FundingStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert_eq!(FundingStatus::ChainObserved.to_string(), "chain_observed");
        assert!(FundingStatus::from_str("cancelled").is_err());
    }

    #[test]
    fn test_currency_parsing() {
        assert_eq!(Currency::from_str("btc").unwrap(), Currency::Btc);
        assert_eq!(Currency::from_str(" USDT ").unwrap(), Currency::Usdt);
        assert_eq!(Currency::Eth.to_string(), "ETH");
        assert!(Currency::from_str("DOGE").is_err());
        assert_eq!(
            serde_json::to_string(&Currency::Bnb).unwrap(),
            "\"BNB\"".to_string()
        );
    }

    #[test]
    fn test_new_request_normalizes_wallet() {
        let request = NewFundingRequest::new(
            1,
            Currency::Eth,
            dec!(1000),
            "0xCd3B1Afe359d96eD77E3f44B7A55Dc12040858D0",
            12,
        )
        .with_created_at(5)
        .into_request(9);

        assert_eq!(
            request.wallet_address,
            "0xcd3b1afe359d96ed77e3f44b7a55dc12040858d0"
        );
        assert_eq!(request.status, FundingStatus::Pending);
        assert_eq!(request.created_at_ms, 5);
        assert_eq!(request.age_ms(65), 60);
        assert!(!request.has_enough_confirmations());
    }
}

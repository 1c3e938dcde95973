// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Decides whether a chain event may settle a funding request.
//!
//! The validator never mutates anything. Semantic failures are returned as
//! [`Verdict::Rejected`]; only I/O problems (store, price source with no
//! fallback, eligibility backend) surface as errors.

use crate::error::{SettlementError, SettlementResult};
use crate::funding::{ChainEvent, FundingRequest, FundingStatus};
use crate::price_oracle::{PriceError, PriceOracle};
use crate::store::FundingStore;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity verification collaborator
#[async_trait]
pub trait EligibilityCheck: Send + Sync + Debug {
    async fn is_eligible(&self, user_id: u64) -> anyhow::Result<bool>;
}

/// Treats every user as eligible.
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

#[async_trait]
impl EligibilityCheck for AllowAll {
    async fn is_eligible(&self, _user_id: u64) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Fixed allow-list of verified users.
#[derive(Debug, Default, Clone)]
pub struct VerifiedUsers {
    verified: HashSet<u64>,
}

impl VerifiedUsers {
    pub fn new(verified: impl IntoIterator<Item = u64>) -> Self {
        Self {
            verified: verified.into_iter().collect(),
        }
    }
}

#[async_trait]
impl EligibilityCheck for VerifiedUsers {
    async fn is_eligible(&self, user_id: u64) -> anyhow::Result<bool> {
        Ok(self.verified.contains(&user_id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    NoMatchingRequest,
    HashMismatch { held: String },
    DuplicateHash,
    InvalidAmount(String),
    Underpaid { expected: Decimal, actual: Decimal },
    Overpaid { expected: Decimal, actual: Decimal },
    Ineligible { user_id: u64 },
}

impl RejectReason {
    /// Rejections that are a verdict on the request itself. The others only
    /// discard the event and leave the candidate untouched.
    pub fn fails_request(&self) -> bool {
        matches!(
            self,
            RejectReason::Underpaid { .. }
                | RejectReason::Overpaid { .. }
                | RejectReason::Ineligible { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::NoMatchingRequest => "no_matching_request",
            RejectReason::HashMismatch { .. } => "hash_mismatch",
            RejectReason::DuplicateHash => "duplicate_hash",
            RejectReason::InvalidAmount(_) => "invalid_amount",
            RejectReason::Underpaid { .. } => "underpaid",
            RejectReason::Overpaid { .. } => "overpaid",
            RejectReason::Ineligible { .. } => "ineligible",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoMatchingRequest => {
                f.write_str("No pending funding request matches this transfer")
            }
            RejectReason::HashMismatch { held } => {
                write!(f, "Funding request is already bound to transaction {}", held)
            }
            RejectReason::DuplicateHash => f.write_str("Transaction has already been settled"),
            RejectReason::InvalidAmount(raw) => write!(f, "Unparseable transfer amount '{}'", raw),
            RejectReason::Underpaid { expected, actual } => write!(
                f,
                "Insufficient amount received. Expected ~${:.2}, got ${:.2}",
                expected, actual
            ),
            RejectReason::Overpaid { expected, actual } => write!(
                f,
                "Amount too large. Expected ~${:.2}, got ${:.2}",
                expected, actual
            ),
            RejectReason::Ineligible { user_id } => {
                write!(f, "User {} is not eligible for funding", user_id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeferReason {
    /// Only the last-resort price was available
    LowConfidencePrice { provisional_usd: Decimal },
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::LowConfidencePrice { provisional_usd } => write!(
                f,
                "Only a low-confidence price is available (provisional value ${:.2})",
                provisional_usd
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted {
        actual_usd: Decimal,
    },
    Rejected {
        reason: RejectReason,
        actual_usd: Option<Decimal>,
    },
    Deferred {
        reason: DeferReason,
    },
}

impl Verdict {
    fn rejected(reason: RejectReason) -> Self {
        Verdict::Rejected {
            reason,
            actual_usd: None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Accepted { .. } => "accepted",
            Verdict::Rejected { reason, .. } => reason.label(),
            Verdict::Deferred { .. } => "deferred",
        }
    }
}

/// Inclusive `[expected * (1 - t/100), expected * (1 + t/100)]`.
pub fn tolerance_band(expected: Decimal, tolerance_percent: Decimal) -> (Decimal, Decimal) {
    let delta = expected * tolerance_percent / Decimal::ONE_HUNDRED;
    (expected - delta, expected + delta)
}

#[derive(Debug)]
pub struct TransactionValidator {
    store: Arc<dyn FundingStore>,
    oracle: Arc<PriceOracle>,
    eligibility: Arc<dyn EligibilityCheck>,
    tolerance_percent: Decimal,
}

impl TransactionValidator {
    pub fn new(
        store: Arc<dyn FundingStore>,
        oracle: Arc<PriceOracle>,
        eligibility: Arc<dyn EligibilityCheck>,
        tolerance_percent: Decimal,
    ) -> Self {
        Self {
            store,
            oracle,
            eligibility,
            tolerance_percent,
        }
    }

    pub fn oracle(&self) -> &Arc<PriceOracle> {
        &self.oracle
    }

    pub async fn validate(
        &self,
        event: &ChainEvent,
        candidate: Option<&FundingRequest>,
    ) -> SettlementResult<Verdict> {
        let Some(request) = candidate else {
            debug!("[Validator] No candidate request for {}", event);
            return Ok(Verdict::rejected(RejectReason::NoMatchingRequest));
        };

        if request.status != FundingStatus::Pending {
            if let Some(held) = request
                .observed_chain_hash
                .as_deref()
                .filter(|held| *held != event.transaction_hash)
            {
                return Ok(Verdict::rejected(RejectReason::HashMismatch {
                    held: held.to_string(),
                }));
            }
        }

        if self.store.is_hash_settled(&event.transaction_hash).await? {
            info!(
                "[Validator] Transaction {} already settled, ignoring",
                event.transaction_hash
            );
            return Ok(Verdict::rejected(RejectReason::DuplicateHash));
        }

        let conversion = match self.oracle.convert(&event.raw_value, event.symbol).await {
            Ok(conversion) => conversion,
            Err(PriceError::InvalidAmount(raw)) | Err(PriceError::Overflow(raw)) => {
                return Ok(Verdict::rejected(RejectReason::InvalidAmount(raw)));
            }
            Err(e) => return Err(SettlementError::Price(e)),
        };
        if conversion.confidence.is_low() {
            return Ok(Verdict::Deferred {
                reason: DeferReason::LowConfidencePrice {
                    provisional_usd: conversion.usd,
                },
            });
        }

        let actual = conversion.usd;
        let (min, max) = tolerance_band(request.expected_usd, self.tolerance_percent);
        if actual < min {
            return Ok(Verdict::Rejected {
                reason: RejectReason::Underpaid {
                    expected: request.expected_usd,
                    actual,
                },
                actual_usd: Some(actual),
            });
        }
        if actual > max {
            return Ok(Verdict::Rejected {
                reason: RejectReason::Overpaid {
                    expected: request.expected_usd,
                    actual,
                },
                actual_usd: Some(actual),
            });
        }

        let eligible = self
            .eligibility
            .is_eligible(request.user_id)
            .await
            .map_err(|e| SettlementError::Eligibility(e.to_string()))?;
        if !eligible {
            return Ok(Verdict::Rejected {
                reason: RejectReason::Ineligible {
                    user_id: request.user_id,
                },
                actual_usd: Some(actual),
            });
        }

        debug!(
            "[Validator] Accepted {} for request {} (${} vs expected ${})",
            event.transaction_hash, request.id, actual, request.expected_usd
        );
        Ok(Verdict::Accepted { actual_usd: actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funding::{Currency, Observation, ObserveOutcome};
    use crate::store::InMemoryFundingStore;
    use crate::test_utils::{
        static_source, test_oracle, transfer_event, usdt_request, ETH_WALLET,
    };
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<InMemoryFundingStore>,
        validator: TransactionValidator,
    }

    fn fixture(eligibility: Arc<dyn EligibilityCheck>) -> Fixture {
        let store = Arc::new(InMemoryFundingStore::new());
        let validator = TransactionValidator::new(
            store.clone(),
            test_oracle(static_source()),
            eligibility,
            dec!(5),
        );
        Fixture { store, validator }
    }

    async fn verdict_for(fixture: &Fixture, raw_value: &str) -> Verdict {
        let request = fixture
            .store
            .create(usdt_request(1, dec!(1000)))
            .await
            .unwrap();
        let event = transfer_event(Currency::Usdt, &format!("0x{}", request.id), raw_value, 1);
        fixture
            .validator
            .validate(&event, Some(&request))
            .await
            .unwrap()
    }

    #[test]
    fn test_tolerance_band() {
        assert_eq!(tolerance_band(dec!(1000), dec!(5)), (dec!(950), dec!(1050)));
        assert_eq!(tolerance_band(dec!(100), dec!(0)), (dec!(100), dec!(100)));
    }

    #[tokio::test]
    async fn test_tolerance_boundaries() {
        let fixture = fixture(Arc::new(AllowAll));

        // 950.00 and 1050.00 are inside the inclusive band
        assert_eq!(
            verdict_for(&fixture, "950000000").await,
            Verdict::Accepted {
                actual_usd: dec!(950.00)
            }
        );
        assert_eq!(
            verdict_for(&fixture, "1050000000").await,
            Verdict::Accepted {
                actual_usd: dec!(1050.00)
            }
        );

        let Verdict::Rejected { reason, actual_usd } = verdict_for(&fixture, "949990000").await
        else {
            panic!("expected rejection");
        };
        assert!(matches!(reason, RejectReason::Underpaid { .. }));
        assert!(reason.fails_request());
        assert_eq!(actual_usd, Some(dec!(949.99)));
        assert_eq!(
            reason.to_string(),
            "Insufficient amount received. Expected ~$1000.00, got $949.99"
        );

        let Verdict::Rejected { reason, .. } = verdict_for(&fixture, "1050010000").await else {
            panic!("expected rejection");
        };
        assert!(matches!(reason, RejectReason::Overpaid { .. }));
        assert_eq!(
            reason.to_string(),
            "Amount too large. Expected ~$1000.00, got $1050.01"
        );
    }

    #[tokio::test]
    async fn test_no_candidate() {
        let fixture = fixture(Arc::new(AllowAll));
        let event = transfer_event(Currency::Eth, "0x1", "1", 1);
        let verdict = fixture.validator.validate(&event, None).await.unwrap();
        let Verdict::Rejected { reason, .. } = verdict else {
            panic!("expected rejection");
        };
        assert_eq!(reason, RejectReason::NoMatchingRequest);
        assert!(!reason.fails_request());
    }

    #[tokio::test]
    async fn test_hash_mismatch_and_duplicate() {
        let fixture = fixture(Arc::new(AllowAll));
        let request = fixture
            .store
            .create(usdt_request(1, dec!(1000)))
            .await
            .unwrap();
        let outcome = fixture
            .store
            .observe(
                request.id,
                Observation {
                    chain_hash: "0xheld".to_string(),
                    confirmations: 1,
                    block_number: None,
                    actual_usd: dec!(1000),
                },
            )
            .await
            .unwrap();
        let ObserveOutcome::Observed(observed) = outcome else {
            panic!("expected observation");
        };

        let other = transfer_event(Currency::Usdt, "0xother", "1000000000", 1);
        assert_eq!(
            fixture
                .validator
                .validate(&other, Some(&observed))
                .await
                .unwrap(),
            Verdict::Rejected {
                reason: RejectReason::HashMismatch {
                    held: "0xheld".to_string()
                },
                actual_usd: None
            }
        );

        // drive the request to settled, then replay its hash
        fixture
            .store
            .transition(
                request.id,
                FundingStatus::ChainObserved,
                FundingStatus::Confirmed,
                None,
            )
            .await
            .unwrap();
        fixture
            .store
            .settle(request.id, &Default::default())
            .await
            .unwrap();
        let replay = transfer_event(Currency::Usdt, "0xheld", "1000000000", 30);
        let fresh = fixture
            .store
            .create(usdt_request(1, dec!(1000)))
            .await
            .unwrap();
        let Verdict::Rejected { reason, .. } = fixture
            .validator
            .validate(&replay, Some(&fresh))
            .await
            .unwrap()
        else {
            panic!("expected rejection");
        };
        assert_eq!(reason, RejectReason::DuplicateHash);
    }

    #[tokio::test]
    async fn test_invalid_amount() {
        let fixture = fixture(Arc::new(AllowAll));
        let Verdict::Rejected { reason, .. } = verdict_for(&fixture, "12.5").await else {
            panic!("expected rejection");
        };
        assert_eq!(reason, RejectReason::InvalidAmount("12.5".to_string()));
        assert!(!reason.fails_request());
    }

    #[tokio::test]
    async fn test_low_confidence_price_defers() {
        let source = static_source();
        source.set_online(false);
        let store = Arc::new(InMemoryFundingStore::new());
        let validator =
            TransactionValidator::new(store.clone(), test_oracle(source), Arc::new(AllowAll), dec!(5));
        let request = store.create(usdt_request(1, dec!(1000))).await.unwrap();
        let event = transfer_event(Currency::Usdt, "0x1", "1000000000", 1);

        let verdict = validator.validate(&event, Some(&request)).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Deferred {
                reason: DeferReason::LowConfidencePrice {
                    provisional_usd: dec!(1000.00)
                }
            }
        );
    }

    #[tokio::test]
    async fn test_ineligible_user() {
        let fixture = fixture(Arc::new(VerifiedUsers::new([2, 3])));
        let Verdict::Rejected { reason, .. } = verdict_for(&fixture, "1000000000").await else {
            panic!("expected rejection");
        };
        assert_eq!(reason, RejectReason::Ineligible { user_id: 1 });
        assert!(reason.fails_request());
    }

    #[derive(Debug)]
    struct BrokenEligibility;

    #[async_trait]
    impl EligibilityCheck for BrokenEligibility {
        async fn is_eligible(&self, _user_id: u64) -> anyhow::Result<bool> {
            Err(anyhow::anyhow!("verification service unavailable"))
        }
    }

    #[tokio::test]
    async fn test_eligibility_failure_is_an_error() {
        let fixture = fixture(Arc::new(BrokenEligibility));
        let request = fixture
            .store
            .create(usdt_request(1, dec!(1000)))
            .await
            .unwrap();
        let event = transfer_event(Currency::Usdt, "0x9", "1000000000", 1);
        let err = fixture
            .validator
            .validate(&event, Some(&request))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Eligibility(_)));
        assert!(err.is_transient());
        assert_eq!(request.wallet_address, ETH_WALLET.to_lowercase());
    }
}

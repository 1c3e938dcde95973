// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::funding::{
    ChainEvent, Currency, FundingRequest, FundingStatus, NewFundingRequest, Observation,
    ObserveOutcome, SettleOutcome, UserLedger,
};
use crate::gateway::{EventGateway, DEFAULT_REDELIVERY_WINDOW};
use crate::metrics::SettlementMetrics;
use crate::pipeline::DepositPipeline;
use crate::price_oracle::{CurrencyPricing, PriceOracle, StaticPriceSource};
use crate::state_machine::{LogNotifier, SettlementStateMachine};
use crate::store::{FundingStore, InMemoryFundingStore, StoreResult};
use crate::utils::{normalize_address, now_ms};
use crate::validator::{AllowAll, TransactionValidator};
use crate::yield_tier::YieldTierTable;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const ETH_WALLET: &str = "0xCd3B1Afe359d96eD77E3f44B7A55Dc12040858D0";
pub const BTC_WALLET: &str = "bc1q0uanf2f9px7q5r7maka05mwanutj8gvpqym62g";

pub fn wallet_for(currency: Currency) -> &'static str {
    match currency {
        Currency::Btc => BTC_WALLET,
        _ => ETH_WALLET,
    }
}

pub fn test_pricing() -> BTreeMap<Currency, CurrencyPricing> {
    [
        (Currency::Btc, dec!(43000)),
        (Currency::Eth, dec!(2500)),
        (Currency::Bnb, dec!(300)),
        (Currency::Usdt, dec!(1)),
        (Currency::Usdc, dec!(1)),
    ]
    .into_iter()
    .map(|(currency, fallback)| {
        (
            currency,
            CurrencyPricing {
                symbol: currency.to_string(),
                decimals: currency.default_decimals(),
                fallback_usd: Some(fallback),
            },
        )
    })
    .collect()
}

pub fn static_source() -> Arc<StaticPriceSource> {
    Arc::new(StaticPriceSource::new([
        ("BTC".to_string(), dec!(43000)),
        ("ETH".to_string(), dec!(2500)),
        ("BNB".to_string(), dec!(300)),
        ("USDT".to_string(), dec!(1)),
        ("USDC".to_string(), dec!(1)),
    ]))
}

pub fn test_oracle(source: Arc<StaticPriceSource>) -> Arc<PriceOracle> {
    oracle_with_pricing(source, test_pricing())
}

pub fn oracle_with_pricing(
    source: Arc<StaticPriceSource>,
    pricing: BTreeMap<Currency, CurrencyPricing>,
) -> Arc<PriceOracle> {
    Arc::new(PriceOracle::new(
        source,
        pricing,
        Duration::from_secs(60),
        Arc::new(SettlementMetrics::new_for_testing()),
    ))
}

pub fn test_gateway() -> EventGateway {
    EventGateway::new(
        [
            (Currency::Btc, BTC_WALLET.to_string()),
            (Currency::Eth, ETH_WALLET.to_string()),
            (Currency::Bnb, ETH_WALLET.to_string()),
            (Currency::Usdt, ETH_WALLET.to_string()),
        ],
        DEFAULT_REDELIVERY_WINDOW,
        Arc::new(SettlementMetrics::new_for_testing()),
    )
}

pub fn eth_request(user_id: u64, expected_usd: Decimal) -> NewFundingRequest {
    NewFundingRequest::new(user_id, Currency::Eth, expected_usd, ETH_WALLET, 12)
}

pub fn usdt_request(user_id: u64, expected_usd: Decimal) -> NewFundingRequest {
    NewFundingRequest::new(user_id, Currency::Usdt, expected_usd, ETH_WALLET, 12)
}

pub fn observation(hash: &str, confirmations: u64, actual_usd: Decimal) -> Observation {
    Observation {
        chain_hash: hash.to_string(),
        confirmations,
        block_number: None,
        actual_usd,
    }
}

/// A normalized transfer to the monitored wallet of `currency`.
pub fn transfer_event(
    currency: Currency,
    hash: &str,
    raw_value: &str,
    confirmations: u64,
) -> ChainEvent {
    ChainEvent {
        transaction_hash: hash.to_string(),
        from_address: "0x742d35cc6559988722e8c5e1b9b8c5c0c9b7c1a8".to_string(),
        to_address: normalize_address(wallet_for(currency)),
        raw_value: raw_value.to_string(),
        symbol: currency,
        confirmations,
        block_number: None,
        observed_at_ms: now_ms(),
    }
}

/// Yields to the scheduler before every call, the way a networked store
/// suspends on I/O.
#[derive(Debug)]
pub struct YieldingStore(pub Arc<InMemoryFundingStore>);

#[async_trait]
impl FundingStore for YieldingStore {
    async fn create(&self, request: NewFundingRequest) -> StoreResult<FundingRequest> {
        tokio::task::yield_now().await;
        self.0.create(request).await
    }

    async fn get(&self, id: u64) -> StoreResult<Option<FundingRequest>> {
        tokio::task::yield_now().await;
        self.0.get(id).await
    }

    async fn find_pending_by_wallet(
        &self,
        wallet: &str,
        currency: Currency,
    ) -> StoreResult<Option<FundingRequest>> {
        tokio::task::yield_now().await;
        self.0.find_pending_by_wallet(wallet, currency).await
    }

    async fn find_by_hash(&self, hash: &str) -> StoreResult<Option<FundingRequest>> {
        tokio::task::yield_now().await;
        self.0.find_by_hash(hash).await
    }

    async fn attach_observation(
        &self,
        id: u64,
        hash: &str,
        confirmations: u64,
    ) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        self.0.attach_observation(id, hash, confirmations).await
    }

    async fn transition(
        &self,
        id: u64,
        from: FundingStatus,
        to: FundingStatus,
        reason: Option<&str>,
    ) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        self.0.transition(id, from, to, reason).await
    }

    async fn observe(&self, id: u64, observation: Observation) -> StoreResult<ObserveOutcome> {
        tokio::task::yield_now().await;
        self.0.observe(id, observation).await
    }

    async fn settle(&self, id: u64, tiers: &YieldTierTable) -> StoreResult<SettleOutcome> {
        tokio::task::yield_now().await;
        self.0.settle(id, tiers).await
    }

    async fn list_in_flight(&self) -> StoreResult<Vec<FundingRequest>> {
        tokio::task::yield_now().await;
        self.0.list_in_flight().await
    }

    async fn count_by_status(&self, status: FundingStatus) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        self.0.count_by_status(status).await
    }

    async fn ledger(&self, user_id: u64) -> StoreResult<Option<UserLedger>> {
        tokio::task::yield_now().await;
        self.0.ledger(user_id).await
    }
}

/// In-memory pipeline with a static price source and every user eligible.
/// `store` is the backing store, for setup and inspection.
pub struct TestHarness {
    pub store: Arc<InMemoryFundingStore>,
    pub source: Arc<StaticPriceSource>,
    pub pipeline: Arc<DepositPipeline>,
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryFundingStore::new());
        Self::build(store.clone(), store, test_pricing())
    }

    pub fn with_pricing(pricing: BTreeMap<Currency, CurrencyPricing>) -> Self {
        let store = Arc::new(InMemoryFundingStore::new());
        Self::build(store.clone(), store, pricing)
    }

    /// The pipeline reaches the store through a [`YieldingStore`].
    pub fn yielding() -> Self {
        let store = Arc::new(InMemoryFundingStore::new());
        Self::build(
            store.clone(),
            Arc::new(YieldingStore(store)),
            test_pricing(),
        )
    }

    fn build(
        store: Arc<InMemoryFundingStore>,
        ledger: Arc<dyn FundingStore>,
        pricing: BTreeMap<Currency, CurrencyPricing>,
    ) -> Self {
        let metrics = Arc::new(SettlementMetrics::new_for_testing());
        let source = static_source();
        let validator = TransactionValidator::new(
            ledger.clone(),
            oracle_with_pricing(source.clone(), pricing),
            Arc::new(AllowAll),
            dec!(5),
        );
        let machine = Arc::new(SettlementStateMachine::new(
            ledger.clone(),
            Arc::new(YieldTierTable::default()),
            Arc::new(LogNotifier),
            metrics.clone(),
        ));
        let pipeline = Arc::new(DepositPipeline::new(
            Arc::new(test_gateway()),
            validator,
            machine,
            ledger,
            Duration::from_secs(24 * 3600),
            metrics,
        ));
        Self {
            store,
            source,
            pipeline,
        }
    }
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Where confirmation depth comes from.
//!
//! The strategy is chosen once at startup. [`PolledSimulation`] fabricates
//! transfers and depth from elapsed time for deployments without chain
//! access; [`LiveFeed`] derives depth from each chain's head and otherwise
//! relies on the counts pushed through the webhook.

use crate::funding::{ChainEvent, Currency, FundingRequest, FundingStatus};
use crate::price_oracle::{PriceError, PriceOracle};
use crate::retry_with_max_elapsed_time;
use crate::ttl_cache::TtlCache;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const SIMULATED_SENDER: &str = "simulation";

pub type ConfirmationResult<T> = Result<T, ConfirmationError>;

#[derive(Debug, Error)]
pub enum ConfirmationError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error(transparent)]
    Price(#[from] PriceError),

    #[error("{0}")]
    Internal(String),
}

impl ConfirmationError {
    /// Transport failures are worth another attempt; a garbled head is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConfirmationError::Rpc(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedMode {
    Live,
    #[default]
    Simulated,
}

impl FeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Live => "live",
            FeedMode::Simulated => "simulated",
        }
    }
}

#[async_trait]
pub trait ConfirmationSource: Send + Sync + Debug {
    fn mode(&self) -> FeedMode;

    /// A transfer for a `pending` request that has waited long enough, if
    /// this source fabricates them.
    async fn synthesize_observation(
        &self,
        request: &FundingRequest,
        now_ms: u64,
    ) -> ConfirmationResult<Option<ChainEvent>>;

    /// Current depth of the transfer observed for `request`, when known.
    async fn current_confirmations(
        &self,
        request: &FundingRequest,
        now_ms: u64,
    ) -> ConfirmationResult<Option<u64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationTiming {
    /// Age at which a pending request gets a fabricated transfer
    pub min_elapsed: Duration,
    /// One more confirmation per block time after that
    pub block_time: Duration,
}

#[derive(Debug)]
pub struct PolledSimulation {
    oracle: Arc<PriceOracle>,
    timings: HashMap<Currency, SimulationTiming>,
}

impl PolledSimulation {
    pub fn new(oracle: Arc<PriceOracle>, timings: HashMap<Currency, SimulationTiming>) -> Self {
        Self { oracle, timings }
    }

    pub fn simulated_hash(request_id: u64) -> String {
        format!("sim_{}", request_id)
    }

    /// Simulated depth, or None while the request is too young.
    fn depth(&self, request: &FundingRequest, now_ms: u64) -> Option<u64> {
        let timing = self.timings.get(&request.currency)?;
        let age = Duration::from_millis(request.age_ms(now_ms));
        let since = age.checked_sub(timing.min_elapsed)?;
        let block_ms = timing.block_time.as_millis().max(1);
        Some(1 + (since.as_millis() / block_ms) as u64)
    }
}

#[async_trait]
impl ConfirmationSource for PolledSimulation {
    fn mode(&self) -> FeedMode {
        FeedMode::Simulated
    }

    async fn synthesize_observation(
        &self,
        request: &FundingRequest,
        now_ms: u64,
    ) -> ConfirmationResult<Option<ChainEvent>> {
        if request.status != FundingStatus::Pending {
            return Ok(None);
        }
        let Some(confirmations) = self.depth(request, now_ms) else {
            return Ok(None);
        };
        let raw_value = self
            .oracle
            .usd_to_units(request.expected_usd, request.currency)
            .await?;
        debug!(
            "[Simulation] Fabricating transfer of {} {} units for request {}",
            raw_value, request.currency, request.id
        );
        Ok(Some(ChainEvent {
            transaction_hash: Self::simulated_hash(request.id),
            from_address: SIMULATED_SENDER.to_string(),
            to_address: request.wallet_address.clone(),
            raw_value,
            symbol: request.currency,
            confirmations,
            block_number: None,
            observed_at_ms: now_ms,
        }))
    }

    async fn current_confirmations(
        &self,
        request: &FundingRequest,
        now_ms: u64,
    ) -> ConfirmationResult<Option<u64>> {
        if request.observed_chain_hash.is_none() {
            return Ok(None);
        }
        Ok(self.depth(request, now_ms))
    }
}

/// Latest block height of one chain
#[async_trait]
pub trait BlockHeightSource: Send + Sync + Debug {
    async fn latest_block(&self) -> ConfirmationResult<u64>;
}

/// Polls a JSON-RPC node (`eth_blockNumber` by default). The head is cached
/// briefly so one reaper tick issues at most one call per chain.
#[derive(Debug)]
pub struct JsonRpcBlockHeight {
    client: reqwest::Client,
    url: Url,
    method: String,
    cache: TtlCache<(), u64>,
    max_retry_elapsed: Duration,
}

impl JsonRpcBlockHeight {
    pub fn new(
        url: Url,
        method: Option<String>,
        cache_ttl: Duration,
        max_retry_elapsed: Duration,
    ) -> ConfirmationResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfirmationError::Rpc(e.to_string()))?;
        Ok(Self {
            client,
            url,
            method: method.unwrap_or_else(|| "eth_blockNumber".to_string()),
            cache: TtlCache::new(cache_ttl),
            max_retry_elapsed,
        })
    }

    async fn fetch_block_number(&self) -> ConfirmationResult<u64> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": self.method,
            "params": [],
            "id": 1
        });
        let response: Value = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| ConfirmationError::Rpc(e.to_string()))?
            .json()
            .await
            .map_err(|e| ConfirmationError::Rpc(format!("invalid response: {}", e)))?;
        if let Some(err) = response.get("error") {
            return Err(ConfirmationError::Rpc(format!(
                "{} returned error: {}",
                self.method, err
            )));
        }
        parse_block_number(response.get("result").unwrap_or(&Value::Null))
    }
}

/// Accepts hex quantities (`"0x10d4f"`), decimal strings and plain numbers.
fn parse_block_number(result: &Value) -> ConfirmationResult<u64> {
    let parsed = match result {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    };
    parsed.ok_or_else(|| ConfirmationError::Internal(format!("unexpected block number {}", result)))
}

#[async_trait]
impl BlockHeightSource for JsonRpcBlockHeight {
    async fn latest_block(&self) -> ConfirmationResult<u64> {
        if let Some(head) = self.cache.get_if_valid(&()).await {
            return Ok(head);
        }
        let head = retry_with_max_elapsed_time!(
            self.fetch_block_number(),
            self.max_retry_elapsed,
            ConfirmationError::is_transient
        )?;
        self.cache.update((), head).await;
        Ok(head)
    }
}

#[derive(Debug, Default)]
pub struct LiveFeed {
    heights: HashMap<Currency, Arc<dyn BlockHeightSource>>,
}

impl LiveFeed {
    pub fn new(heights: HashMap<Currency, Arc<dyn BlockHeightSource>>) -> Self {
        Self { heights }
    }
}

#[async_trait]
impl ConfirmationSource for LiveFeed {
    fn mode(&self) -> FeedMode {
        FeedMode::Live
    }

    async fn synthesize_observation(
        &self,
        _request: &FundingRequest,
        _now_ms: u64,
    ) -> ConfirmationResult<Option<ChainEvent>> {
        Ok(None)
    }

    async fn current_confirmations(
        &self,
        request: &FundingRequest,
        _now_ms: u64,
    ) -> ConfirmationResult<Option<u64>> {
        let (Some(block), Some(heights)) = (
            request.observed_block_number,
            self.heights.get(&request.currency),
        ) else {
            // depth then only arrives through the webhook
            return Ok(None);
        };
        let head = heights.latest_block().await?;
        Ok(head.checked_sub(block).map(|depth| depth + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funding::NewFundingRequest;
    use crate::test_utils::{static_source, test_oracle, ETH_WALLET};
    use axum::{routing::post, Json, Router};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn request(currency: Currency, created_at_ms: u64) -> FundingRequest {
        NewFundingRequest::new(3, currency, dec!(1000), ETH_WALLET, 12)
            .with_created_at(created_at_ms)
            .into_request(42)
    }

    fn simulation() -> PolledSimulation {
        PolledSimulation::new(
            test_oracle(static_source()),
            HashMap::from([(
                Currency::Eth,
                SimulationTiming {
                    min_elapsed: Duration::from_secs(120),
                    block_time: Duration::from_secs(12),
                },
            )]),
        )
    }

    #[tokio::test]
    async fn test_simulation_waits_for_min_elapsed() {
        let sim = simulation();
        let pending = request(Currency::Eth, 0);

        assert!(sim
            .synthesize_observation(&pending, 119_999)
            .await
            .unwrap()
            .is_none());

        let event = sim
            .synthesize_observation(&pending, 120_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.transaction_hash, "sim_42");
        assert_eq!(event.confirmations, 1);
        assert_eq!(event.symbol, Currency::Eth);
        // $1000 at $2500/ETH
        assert_eq!(event.raw_value, "400000000000000000");

        // currencies without timing are never simulated
        assert!(sim
            .synthesize_observation(&request(Currency::Btc, 0), 10_000_000)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_simulated_depth_grows_with_block_time() {
        let sim = simulation();
        let mut observed = request(Currency::Eth, 0);
        assert_eq!(
            sim.current_confirmations(&observed, 500_000).await.unwrap(),
            None
        );

        observed.status = FundingStatus::ChainObserved;
        observed.observed_chain_hash = Some("sim_42".to_string());
        assert_eq!(
            sim.current_confirmations(&observed, 120_000).await.unwrap(),
            Some(1)
        );
        // 11 blocks of 12s after the first confirmation
        assert_eq!(
            sim.current_confirmations(&observed, 120_000 + 132_000)
                .await
                .unwrap(),
            Some(12)
        );
        assert!(sim
            .synthesize_observation(&observed, 900_000)
            .await
            .unwrap()
            .is_none());
    }

    #[derive(Debug)]
    struct FixedHead(u64);

    #[async_trait]
    impl BlockHeightSource for FixedHead {
        async fn latest_block(&self) -> ConfirmationResult<u64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_live_feed_depth_from_head() {
        let feed = LiveFeed::new(HashMap::from([(
            Currency::Eth,
            Arc::new(FixedHead(1_011)) as Arc<dyn BlockHeightSource>,
        )]));
        let mut observed = request(Currency::Eth, 0);
        observed.status = FundingStatus::ChainObserved;
        observed.observed_chain_hash = Some("0xabc".to_string());
        assert_eq!(
            feed.current_confirmations(&observed, 0).await.unwrap(),
            None
        );

        observed.observed_block_number = Some(1_000);
        assert_eq!(
            feed.current_confirmations(&observed, 0).await.unwrap(),
            Some(12)
        );
        observed.observed_block_number = Some(2_000);
        assert_eq!(
            feed.current_confirmations(&observed, 0).await.unwrap(),
            None
        );
        assert!(feed
            .synthesize_observation(&request(Currency::Eth, 0), u64::MAX)
            .await
            .unwrap()
            .is_none());
        assert_eq!(feed.mode(), FeedMode::Live);
    }

    #[test]
    fn test_parse_block_number() {
        assert_eq!(
            parse_block_number(&Value::String("0x10d4f".to_string())).unwrap(),
            68_943
        );
        assert_eq!(parse_block_number(&serde_json::json!(830_000)).unwrap(), 830_000);
        assert_eq!(
            parse_block_number(&Value::String("123".to_string())).unwrap(),
            123
        );
        assert!(parse_block_number(&Value::Null).is_err());
    }

    #[tokio::test]
    async fn test_json_rpc_block_height_is_cached() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/",
            post(move |Json(body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(body["method"], "eth_blockNumber");
                    Json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": "0x3e8"}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let source = JsonRpcBlockHeight::new(
            format!("http://{}/", addr).parse().unwrap(),
            None,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(source.latest_block().await.unwrap(), 1_000);
        assert_eq!(source.latest_block().await.unwrap(), 1_000);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Price quote collaborators.

use super::{PriceError, PriceResult};
use crate::utils::now_ms;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

pub const COINMARKETCAP_BASE_URL: &str = "https://pro-api.coinmarketcap.com";
const QUOTES_LATEST_PATH: &str = "/v1/cryptocurrency/quotes/latest";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A USD quote as reported by a price source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuote {
    pub usd_per_unit: Decimal,
    pub as_of_ms: u64,
}

/// External price source. Failures are soft: the oracle absorbs them.
#[async_trait]
pub trait PriceSource: Send + Sync + Debug {
    async fn fetch(&self, symbol: &str) -> PriceResult<SourceQuote>;

    /// Source name for logging
    fn name(&self) -> &str;
}

/// CoinMarketCap `quotes/latest` client
#[derive(Debug, Clone)]
pub struct CoinMarketCapSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl CoinMarketCapSource {
    pub fn new(api_key: String, base_url: Option<String>) -> PriceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PriceError::Source(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| COINMARKETCAP_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl PriceSource for CoinMarketCapSource {
    async fn fetch(&self, symbol: &str) -> PriceResult<SourceQuote> {
        let url = format!("{}{}", self.base_url, QUOTES_LATEST_PATH);
        let response = self
            .client
            .get(&url)
            .header("X-CMC_PRO_API_KEY", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("symbol", symbol), ("convert", "USD")])
            .send()
            .await
            .map_err(|e| PriceError::Source(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| PriceError::Source(format!("invalid response body: {}", e)))?;
        if !status.is_success() {
            let message = body
                .pointer("/status/error_message")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            return Err(PriceError::Source(format!("HTTP {}: {}", status, message)));
        }

        let usd_per_unit = parse_quote(&body, symbol)?;
        debug!(
            "[PriceOracle] {} quoted {} at ${}",
            self.name(),
            symbol,
            usd_per_unit
        );
        Ok(SourceQuote {
            usd_per_unit,
            as_of_ms: now_ms(),
        })
    }

    fn name(&self) -> &str {
        "coinmarketcap"
    }
}

/// Extract `data.<SYMBOL>.quote.USD.price`; v2 responses wrap the entry in an array.
fn parse_quote(body: &Value, symbol: &str) -> PriceResult<Decimal> {
    let entry = body
        .get("data")
        .and_then(|data| data.get(symbol))
        .map(|entry| match entry {
            Value::Array(items) => items.first().unwrap_or(&Value::Null),
            other => other,
        })
        .ok_or_else(|| PriceError::MissingQuote(symbol.to_string()))?;
    let price = entry
        .pointer("/quote/USD/price")
        .and_then(Value::as_f64)
        .ok_or_else(|| PriceError::MissingQuote(symbol.to_string()))?;
    Decimal::try_from(price).map_err(|_| PriceError::InvalidPrice(price.to_string()))
}

/// Fixed price table. Serves offline deployments and tests; can be switched
/// offline to exercise the oracle's degraded paths.
#[derive(Debug, Default)]
pub struct StaticPriceSource {
    prices: RwLock<HashMap<String, Decimal>>,
    offline: AtomicBool,
    fetches: AtomicU64,
}

impl StaticPriceSource {
    pub fn new(prices: impl IntoIterator<Item = (String, Decimal)>) -> Self {
        Self {
            prices: RwLock::new(prices.into_iter().collect()),
            offline: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
        }
    }

    pub async fn set_price(&self, symbol: &str, usd_per_unit: Decimal) {
        self.prices
            .write()
            .await
            .insert(symbol.to_string(), usd_per_unit);
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn fetch(&self, symbol: &str) -> PriceResult<SourceQuote> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(PriceError::Source("static source offline".to_string()));
        }
        let prices = self.prices.read().await;
        let usd_per_unit = prices
            .get(symbol)
            .copied()
            .ok_or_else(|| PriceError::MissingQuote(symbol.to_string()))?;
        Ok(SourceQuote {
            usd_per_unit,
            as_of_ms: now_ms(),
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}

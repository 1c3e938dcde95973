// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! USD conversion of raw on-chain amounts.
//!
//! Quotes are cached per currency for the configured freshness window. When
//! the source fails the oracle degrades in two steps:
//! - the last cached quote, however old (`Confidence::Stale`)
//! - the configured last-resort price (`Confidence::Fallback`)
//!
//! Only `Fallback` conversions are low-confidence; the validator never
//! accepts a transfer on one.

use crate::funding::Currency;
use crate::metrics::SettlementMetrics;
use crate::ttl_cache::{CacheStats, TtlCache};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

pub mod source;

pub use source::{CoinMarketCapSource, PriceSource, SourceQuote, StaticPriceSource};

pub type PriceResult<T> = Result<T, PriceError>;

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("Price source error: {0}")]
    Source(String),

    #[error("No quote returned for {0}")]
    MissingQuote(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("No price mapping configured for {0}")]
    UnknownCurrency(Currency),

    #[error("Invalid raw amount '{0}'")]
    InvalidAmount(String),

    #[error("Amount out of range: {0}")]
    Overflow(String),
}

impl PriceError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PriceError::Source(_) | PriceError::MissingQuote(_) | PriceError::InvalidPrice(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Fetched within the freshness window
    Fresh,
    /// Last cached quote, used because a refresh failed
    Stale,
    /// Hardcoded last-resort price
    Fallback,
}

impl Confidence {
    pub fn is_low(&self) -> bool {
        matches!(self, Confidence::Fallback)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Fresh => "fresh",
            Confidence::Stale => "stale",
            Confidence::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub usd_per_unit: Decimal,
    pub confidence: Confidence,
    pub as_of_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    /// Amount in whole units (e.g. ETH, not wei)
    pub amount: Decimal,
    /// USD value rounded to cents
    pub usd: Decimal,
    pub usd_per_unit: Decimal,
    pub confidence: Confidence,
}

/// How a currency is priced
#[derive(Debug, Clone, PartialEq)]
pub struct CurrencyPricing {
    /// Symbol understood by the price source
    pub symbol: String,
    /// Decimal exponent of the chain-native unit
    pub decimals: u32,
    /// Last-resort price when the source is down and nothing is cached
    pub fallback_usd: Option<Decimal>,
}

#[derive(Debug)]
pub struct PriceOracle {
    source: Arc<dyn PriceSource>,
    pricing: BTreeMap<Currency, CurrencyPricing>,
    cache: TtlCache<Currency, SourceQuote>,
    metrics: Arc<SettlementMetrics>,
}

impl PriceOracle {
    pub fn new(
        source: Arc<dyn PriceSource>,
        pricing: BTreeMap<Currency, CurrencyPricing>,
        freshness: Duration,
        metrics: Arc<SettlementMetrics>,
    ) -> Self {
        Self {
            source,
            pricing,
            cache: TtlCache::new(freshness),
            metrics,
        }
    }

    pub fn pricing(&self, currency: Currency) -> PriceResult<&CurrencyPricing> {
        self.pricing
            .get(&currency)
            .ok_or(PriceError::UnknownCurrency(currency))
    }

    pub async fn price(&self, currency: Currency) -> PriceResult<PriceQuote> {
        let pricing = self.pricing(currency)?;
        let quote = match self.cache.get_if_valid(&currency).await {
            Some(cached) => PriceQuote {
                usd_per_unit: cached.usd_per_unit,
                confidence: Confidence::Fresh,
                as_of_ms: cached.as_of_ms,
            },
            None => self.refresh(currency, pricing).await?,
        };
        self.metrics
            .price_lookups
            .with_label_values(&[quote.confidence.as_str()])
            .inc();
        Ok(quote)
    }

    async fn refresh(
        &self,
        currency: Currency,
        pricing: &CurrencyPricing,
    ) -> PriceResult<PriceQuote> {
        let fetched = self.source.fetch(&pricing.symbol).await.and_then(|quote| {
            if quote.usd_per_unit > Decimal::ZERO {
                Ok(quote)
            } else {
                Err(PriceError::InvalidPrice(quote.usd_per_unit.to_string()))
            }
        });
        let err = match fetched {
            Ok(quote) => {
                self.cache.update(currency, quote.clone()).await;
                return Ok(PriceQuote {
                    usd_per_unit: quote.usd_per_unit,
                    confidence: Confidence::Fresh,
                    as_of_ms: quote.as_of_ms,
                });
            }
            Err(err) => err,
        };

        if let Some((cached, age)) = self.cache.get_last_known(&currency).await {
            warn!(
                "[PriceOracle] Refresh of {} via {} failed ({}), using stale price ${} ({}s old)",
                pricing.symbol,
                self.source.name(),
                err,
                cached.usd_per_unit,
                age.as_secs()
            );
            return Ok(PriceQuote {
                usd_per_unit: cached.usd_per_unit,
                confidence: Confidence::Stale,
                as_of_ms: cached.as_of_ms,
            });
        }

        match pricing.fallback_usd {
            Some(fallback) => {
                error!(
                    "[PriceOracle] Refresh of {} via {} failed ({}) with nothing cached, using last-resort price ${}",
                    pricing.symbol,
                    self.source.name(),
                    err,
                    fallback
                );
                Ok(PriceQuote {
                    usd_per_unit: fallback,
                    confidence: Confidence::Fallback,
                    as_of_ms: 0,
                })
            }
            None => Err(err),
        }
    }

    /// Convert a raw chain-native amount into USD.
    pub async fn convert(&self, raw_value: &str, currency: Currency) -> PriceResult<Conversion> {
        let pricing = self.pricing(currency)?;
        let amount = units_to_decimal(raw_value, pricing.decimals)?;
        let quote = self.price(currency).await?;
        let usd = amount
            .checked_mul(quote.usd_per_unit)
            .ok_or_else(|| PriceError::Overflow(raw_value.to_string()))?
            .round_dp(2);
        Ok(Conversion {
            amount,
            usd,
            usd_per_unit: quote.usd_per_unit,
            confidence: quote.confidence,
        })
    }

    /// Inverse of [`PriceOracle::convert`]: chain-native units worth `usd`.
    pub async fn usd_to_units(&self, usd: Decimal, currency: Currency) -> PriceResult<String> {
        let pricing = self.pricing(currency)?;
        let quote = self.price(currency).await?;
        let scale = Decimal::from_i128_with_scale(10i128.pow(pricing.decimals), 0);
        let units = usd
            .checked_div(quote.usd_per_unit)
            .and_then(|amount| amount.checked_mul(scale))
            .ok_or_else(|| PriceError::Overflow(usd.to_string()))?
            .round();
        Ok(units.to_string())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Parse an integer amount (decimal or `0x` hex) and shift it by `decimals`.
pub fn units_to_decimal(raw: &str, decimals: u32) -> PriceResult<Decimal> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u128::from_str_radix(hex, 16),
        None => raw.parse::<u128>(),
    };
    let units = parsed.map_err(|_| PriceError::InvalidAmount(raw.to_string()))?;
    let units = i128::try_from(units).map_err(|_| PriceError::Overflow(raw.to_string()))?;
    Decimal::try_from_i128_with_scale(units, decimals)
        .map_err(|_| PriceError::Overflow(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_pricing;
    use rust_decimal_macros::dec;

    fn oracle_with(source: Arc<StaticPriceSource>, freshness: Duration) -> PriceOracle {
        PriceOracle::new(
            source,
            test_pricing(),
            freshness,
            Arc::new(SettlementMetrics::new_for_testing()),
        )
    }

    #[test]
    fn test_units_to_decimal() {
        assert_eq!(
            units_to_decimal("1000000000000000000", 18).unwrap(),
            dec!(1)
        );
        assert_eq!(units_to_decimal("100000000", 8).unwrap(), dec!(1));
        assert_eq!(units_to_decimal("0xde0b6b3a7640000", 18).unwrap(), dec!(1));
        assert_eq!(units_to_decimal(" 1500000 ", 6).unwrap(), dec!(1.5));
        assert!(matches!(
            units_to_decimal("1.5", 18),
            Err(PriceError::InvalidAmount(_))
        ));
        assert!(matches!(
            units_to_decimal("-1", 18),
            Err(PriceError::InvalidAmount(_))
        ));
        assert!(units_to_decimal("", 8).is_err());
        // more than 96 bits of mantissa
        assert!(matches!(
            units_to_decimal("340282366920938463463374607431768211455", 18),
            Err(PriceError::Overflow(_))
        ));
    }

    #[tokio::test]
    async fn test_convert_is_unit_aware() {
        let source = Arc::new(StaticPriceSource::new([
            ("ETH".to_string(), dec!(2500)),
            ("BTC".to_string(), dec!(43000)),
            ("USDT".to_string(), dec!(1)),
        ]));
        let oracle = oracle_with(source, Duration::from_secs(60));

        let eth = oracle
            .convert("400000000000000000", Currency::Eth)
            .await
            .unwrap();
        assert_eq!(eth.usd, dec!(1000.00));
        assert_eq!(eth.confidence, Confidence::Fresh);

        let btc = oracle.convert("2500000", Currency::Btc).await.unwrap();
        assert_eq!(btc.usd, dec!(1075.00));

        let usdt = oracle.convert("949990000", Currency::Usdt).await.unwrap();
        assert_eq!(usdt.usd, dec!(949.99));
    }

    #[tokio::test]
    async fn test_cache_serves_within_freshness() {
        let source = Arc::new(StaticPriceSource::new([("ETH".to_string(), dec!(2500))]));
        let oracle = oracle_with(source.clone(), Duration::from_secs(60));

        oracle.price(Currency::Eth).await.unwrap();
        oracle.price(Currency::Eth).await.unwrap();
        oracle.price(Currency::Eth).await.unwrap();
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(oracle.cache_stats().hits, 2);
    }

    #[tokio::test]
    async fn test_refresh_after_freshness_window() {
        let source = Arc::new(StaticPriceSource::new([("ETH".to_string(), dec!(2500))]));
        let oracle = oracle_with(source.clone(), Duration::from_millis(20));

        assert_eq!(
            oracle.price(Currency::Eth).await.unwrap().usd_per_unit,
            dec!(2500)
        );
        source.set_price("ETH", dec!(2600)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            oracle.price(Currency::Eth).await.unwrap().usd_per_unit,
            dec!(2600)
        );
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_price_on_refresh_failure() {
        let source = Arc::new(StaticPriceSource::new([("ETH".to_string(), dec!(2500))]));
        let oracle = oracle_with(source.clone(), Duration::from_millis(10));

        oracle.price(Currency::Eth).await.unwrap();
        source.set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let quote = oracle.price(Currency::Eth).await.unwrap();
        assert_eq!(quote.usd_per_unit, dec!(2500));
        assert_eq!(quote.confidence, Confidence::Stale);
        assert!(!quote.confidence.is_low());
    }

    #[tokio::test]
    async fn test_fallback_price_is_low_confidence() {
        let source = Arc::new(StaticPriceSource::new([]));
        source.set_online(false);
        let oracle = oracle_with(source, Duration::from_secs(60));

        let conversion = oracle
            .convert("1000000000000000000", Currency::Eth)
            .await
            .unwrap();
        assert_eq!(conversion.usd_per_unit, dec!(2500));
        assert_eq!(conversion.confidence, Confidence::Fallback);
        assert!(conversion.confidence.is_low());
    }

    #[tokio::test]
    async fn test_no_fallback_surfaces_error() {
        let source = Arc::new(StaticPriceSource::new([]));
        source.set_online(false);
        let mut pricing = test_pricing();
        pricing.get_mut(&Currency::Eth).unwrap().fallback_usd = None;
        let oracle = PriceOracle::new(
            source,
            pricing,
            Duration::from_secs(60),
            Arc::new(SettlementMetrics::new_for_testing()),
        );

        let err = oracle.price(Currency::Eth).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_currency() {
        let source = Arc::new(StaticPriceSource::new([]));
        let mut pricing = test_pricing();
        pricing.remove(&Currency::Usdc);
        let oracle = PriceOracle::new(
            source,
            pricing,
            Duration::from_secs(60),
            Arc::new(SettlementMetrics::new_for_testing()),
        );
        assert!(matches!(
            oracle.convert("1", Currency::Usdc).await,
            Err(PriceError::UnknownCurrency(Currency::Usdc))
        ));
    }

    #[tokio::test]
    async fn test_usd_to_units_round_trips_within_a_cent() {
        let source = Arc::new(StaticPriceSource::new([("ETH".to_string(), dec!(2345.67))]));
        let oracle = oracle_with(source, Duration::from_secs(60));

        let units = oracle.usd_to_units(dec!(1000), Currency::Eth).await.unwrap();
        let back = oracle.convert(&units, Currency::Eth).await.unwrap();
        assert!((back.usd - dec!(1000)).abs() <= dec!(0.01));
    }
}

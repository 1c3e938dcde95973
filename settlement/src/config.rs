// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::confirmation::{FeedMode, SimulationTiming};
use crate::error::{SettlementError, SettlementResult};
use crate::funding::{Currency, NewFundingRequest};
use crate::gateway::DEFAULT_REDELIVERY_WINDOW;
use crate::price_oracle::CurrencyPricing;
use crate::utils::normalize_address;
use crate::yield_tier::{default_tiers, YieldTier, YieldTierTable};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use settlement_config::Config;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

const EVM_WALLET: &str = "0xCd3B1Afe359d96eD77E3f44B7A55Dc12040858D0";
const BTC_WALLET: &str = "bc1q0uanf2f9px7q5r7maka05mwanutj8gvpqym62g";

/// Largest scale a `Decimal` amount can carry.
const MAX_DECIMALS: u32 = 28;

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SettlementNodeConfig {
    // The port that the webhook and query server listens on.
    pub server_listen_port: u16,
    // Postgres URL. The ledger is kept in memory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    // Where confirmation depth comes from (`live` or `simulated`)
    #[serde(default)]
    pub confirmation_feed: FeedMode,
    pub price_source: PriceSourceConfig,
    #[serde(default)]
    pub eligibility: EligibilityConfig,
    #[serde(default = "default_tolerance_percent")]
    pub amount_tolerance_percent: Decimal,
    #[serde(default = "default_max_observation_window_secs")]
    pub max_observation_window_secs: u64,
    #[serde(default = "default_price_cache_freshness_secs")]
    pub price_cache_freshness_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    // Window in which a re-delivered transfer is dropped by the gateway
    #[serde(default = "default_redelivery_window_secs")]
    pub redelivery_window_secs: u64,
    pub currencies: BTreeMap<Currency, CurrencyConfig>,
    #[serde(default = "default_tiers")]
    pub yield_tiers: Vec<YieldTier>,
    // Requests opened at startup. In-memory ledger only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seed_requests: Vec<SeedRequest>,
}

/// A funding request opened when an in-memory node starts
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SeedRequest {
    pub user_id: u64,
    pub currency: Currency,
    pub expected_usd: Decimal,
}

fn default_tolerance_percent() -> Decimal {
    Decimal::from(5)
}

fn default_max_observation_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_price_cache_freshness_secs() -> u64 {
    60
}

fn default_reaper_interval_secs() -> u64 {
    30
}

fn default_redelivery_window_secs() -> u64 {
    DEFAULT_REDELIVERY_WINDOW.as_secs()
}

fn default_min_elapsed_secs() -> u64 {
    120
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum PriceSourceConfig {
    #[serde(rename = "coinmarketcap")]
    CoinMarketCap {
        // Supports `${ENV_VAR}` placeholders
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
    },
    // Fixed quotes, for local runs and tests
    Static { prices: BTreeMap<String, Decimal> },
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum EligibilityConfig {
    #[default]
    AllowAll,
    VerifiedUsers { users: Vec<u64> },
    // `user_verifications` table of the configured database
    Database,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CurrencyConfig {
    pub wallets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_confirmations: Option<u64>,
    #[serde(default = "default_min_elapsed_secs")]
    pub min_elapsed_secs: u64,
    // Symbol understood by the price source, defaults to the currency code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_price_usd: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time_secs: Option<u64>,
    // JSON-RPC endpoint polled for the chain head by the live feed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_method: Option<String>,
}

impl CurrencyConfig {
    pub fn new(currency: Currency, wallet: &str, fallback_price_usd: Decimal) -> Self {
        Self {
            wallets: vec![wallet.to_string()],
            decimals: None,
            required_confirmations: Some(currency.default_required_confirmations()),
            min_elapsed_secs: default_min_elapsed_secs(),
            price_symbol: None,
            fallback_price_usd: Some(fallback_price_usd),
            block_time_secs: None,
            rpc_url: None,
            rpc_method: None,
        }
    }
}

impl Config for SettlementNodeConfig {}

/// Validated per-currency settings
#[derive(Clone, Debug, PartialEq)]
pub struct CurrencyPolicy {
    /// Normalized; the first one receives new funding requests
    pub wallets: Vec<String>,
    pub pricing: CurrencyPricing,
    pub required_confirmations: u64,
    pub timing: SimulationTiming,
    pub rpc_url: Option<Url>,
    pub rpc_method: Option<String>,
}

/// Runtime form of [`SettlementNodeConfig`]
#[derive(Clone, Debug)]
pub struct SettlementPolicy {
    pub server_listen_port: u16,
    pub database_url: Option<String>,
    pub feed_mode: FeedMode,
    pub price_source: PriceSourceConfig,
    pub eligibility: EligibilityConfig,
    pub tolerance_percent: Decimal,
    pub max_observation_window: Duration,
    pub price_cache_freshness: Duration,
    pub reaper_interval: Duration,
    pub redelivery_window: Duration,
    pub currencies: BTreeMap<Currency, CurrencyPolicy>,
    pub tiers: YieldTierTable,
    pub seed_requests: Vec<NewFundingRequest>,
}

impl SettlementNodeConfig {
    /// A config receiving BTC, ETH, BNB and USDT with CoinMarketCap prices.
    pub fn template() -> Self {
        let currencies = [
            (Currency::Btc, BTC_WALLET, Decimal::from(43_000)),
            (Currency::Eth, EVM_WALLET, Decimal::from(2_500)),
            (Currency::Bnb, EVM_WALLET, Decimal::from(300)),
            (Currency::Usdt, EVM_WALLET, Decimal::ONE),
        ]
        .into_iter()
        .map(|(currency, wallet, fallback)| {
            (currency, CurrencyConfig::new(currency, wallet, fallback))
        })
        .collect();
        Self {
            server_listen_port: 9191,
            database_url: None,
            confirmation_feed: FeedMode::Simulated,
            price_source: PriceSourceConfig::CoinMarketCap {
                api_key: "${COINMARKETCAP_API_KEY}".to_string(),
                base_url: None,
            },
            eligibility: EligibilityConfig::AllowAll,
            amount_tolerance_percent: default_tolerance_percent(),
            max_observation_window_secs: default_max_observation_window_secs(),
            price_cache_freshness_secs: default_price_cache_freshness_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            redelivery_window_secs: default_redelivery_window_secs(),
            currencies,
            yield_tiers: default_tiers(),
            seed_requests: Vec::new(),
        }
    }

    pub fn validate(&self) -> SettlementResult<SettlementPolicy> {
        info!("Starting config validation");
        if self.currencies.is_empty() {
            return Err(config_error("no currency configured"));
        }
        if self.amount_tolerance_percent.is_sign_negative()
            || self.amount_tolerance_percent >= Decimal::ONE_HUNDRED
        {
            return Err(config_error(format!(
                "amount-tolerance-percent must be in [0, 100), got {}",
                self.amount_tolerance_percent
            )));
        }
        for (name, secs) in [
            ("max-observation-window-secs", self.max_observation_window_secs),
            ("reaper-interval-secs", self.reaper_interval_secs),
        ] {
            if secs == 0 {
                return Err(config_error(format!("{} must be positive", name)));
            }
        }

        let price_source = match &self.price_source {
            PriceSourceConfig::CoinMarketCap { api_key, base_url } => {
                let api_key = substitute_env_vars(api_key)?;
                if api_key.trim().is_empty() || api_key.contains("${") {
                    return Err(config_error("CoinMarketCap api-key is not set"));
                }
                if let Some(base_url) = base_url {
                    Url::parse(base_url).map_err(|e| {
                        config_error(format!("invalid price source base-url {}: {}", base_url, e))
                    })?;
                }
                PriceSourceConfig::CoinMarketCap {
                    api_key,
                    base_url: base_url.clone(),
                }
            }
            PriceSourceConfig::Static { prices } => {
                if let Some((symbol, price)) = prices.iter().find(|(_, p)| **p <= Decimal::ZERO) {
                    return Err(config_error(format!(
                        "static price for {} must be positive, got {}",
                        symbol, price
                    )));
                }
                self.price_source.clone()
            }
        };

        let mut currencies = BTreeMap::new();
        for (currency, config) in &self.currencies {
            let policy = self.currency_policy(*currency, config, &price_source)?;
            currencies.insert(*currency, policy);
        }

        if matches!(self.eligibility, EligibilityConfig::AllowAll) {
            warn!("Eligibility checks are disabled: every user is treated as verified");
        }
        if matches!(self.eligibility, EligibilityConfig::Database) && self.database_url.is_none() {
            return Err(config_error(
                "eligibility kind `database` requires database-url",
            ));
        }

        if !self.seed_requests.is_empty() && self.database_url.is_some() {
            return Err(config_error(
                "seed-requests only apply when the ledger is kept in memory",
            ));
        }

        let mut policy = SettlementPolicy {
            server_listen_port: self.server_listen_port,
            database_url: self.database_url.clone(),
            feed_mode: self.confirmation_feed,
            price_source,
            eligibility: self.eligibility.clone(),
            tolerance_percent: self.amount_tolerance_percent,
            max_observation_window: Duration::from_secs(self.max_observation_window_secs),
            price_cache_freshness: Duration::from_secs(self.price_cache_freshness_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
            redelivery_window: Duration::from_secs(self.redelivery_window_secs),
            currencies,
            tiers: YieldTierTable::new(self.yield_tiers.clone())?,
            seed_requests: Vec::new(),
        };
        policy.seed_requests = self
            .seed_requests
            .iter()
            .map(|seed| policy.funding_request(seed.user_id, seed.currency, seed.expected_usd))
            .collect::<SettlementResult<_>>()?;
        Ok(policy)
    }

    fn currency_policy(
        &self,
        currency: Currency,
        config: &CurrencyConfig,
        price_source: &PriceSourceConfig,
    ) -> SettlementResult<CurrencyPolicy> {
        let wallets: Vec<String> = config
            .wallets
            .iter()
            .map(|w| normalize_address(w))
            .filter(|w| !w.is_empty())
            .collect();
        if wallets.is_empty() {
            return Err(config_error(format!("{}: no receiving wallet", currency)));
        }

        let symbol = config
            .price_symbol
            .clone()
            .unwrap_or_else(|| currency.to_string());
        if symbol.trim().is_empty() {
            return Err(config_error(format!("{}: empty price-symbol", currency)));
        }
        if let PriceSourceConfig::Static { prices } = price_source {
            if !prices.contains_key(&symbol) && config.fallback_price_usd.is_none() {
                return Err(config_error(format!(
                    "{}: no static price for symbol {}",
                    currency, symbol
                )));
            }
        }
        if let Some(fallback) = config.fallback_price_usd {
            if fallback <= Decimal::ZERO {
                return Err(config_error(format!(
                    "{}: fallback-price-usd must be positive",
                    currency
                )));
            }
        }

        let decimals = config
            .decimals
            .unwrap_or_else(|| currency.default_decimals());
        if decimals > MAX_DECIMALS {
            return Err(config_error(format!(
                "{}: decimals {} exceeds {}",
                currency, decimals, MAX_DECIMALS
            )));
        }

        let block_time_secs = config
            .block_time_secs
            .unwrap_or_else(|| currency.default_block_time_secs());
        if block_time_secs == 0 {
            return Err(config_error(format!("{}: block-time-secs must be positive", currency)));
        }

        let rpc_url = config
            .rpc_url
            .as_deref()
            .map(|url| {
                Url::parse(url)
                    .map_err(|e| config_error(format!("{}: invalid rpc-url {}: {}", currency, url, e)))
            })
            .transpose()?;
        if self.confirmation_feed == FeedMode::Live && rpc_url.is_none() {
            warn!(
                "{}: no rpc-url, confirmations only come from pushed events",
                currency
            );
        }

        Ok(CurrencyPolicy {
            wallets,
            pricing: CurrencyPricing {
                symbol,
                decimals,
                fallback_usd: config.fallback_price_usd,
            },
            required_confirmations: config
                .required_confirmations
                .unwrap_or_else(|| currency.default_required_confirmations())
                .max(1),
            timing: SimulationTiming {
                min_elapsed: Duration::from_secs(config.min_elapsed_secs),
                block_time: Duration::from_secs(block_time_secs),
            },
            rpc_url,
            rpc_method: config.rpc_method.clone(),
        })
    }
}

impl SettlementPolicy {
    pub fn pricing(&self) -> BTreeMap<Currency, CurrencyPricing> {
        self.currencies
            .iter()
            .map(|(currency, policy)| (*currency, policy.pricing.clone()))
            .collect()
    }

    pub fn monitored_wallets(&self) -> Vec<(Currency, String)> {
        self.currencies
            .iter()
            .flat_map(|(currency, policy)| {
                policy
                    .wallets
                    .iter()
                    .map(move |wallet| (*currency, wallet.clone()))
            })
            .collect()
    }

    pub fn simulation_timings(&self) -> HashMap<Currency, SimulationTiming> {
        self.currencies
            .iter()
            .map(|(currency, policy)| (*currency, policy.timing))
            .collect()
    }

    /// A new request paying into the currency's primary wallet.
    pub fn funding_request(
        &self,
        user_id: u64,
        currency: Currency,
        expected_usd: Decimal,
    ) -> SettlementResult<NewFundingRequest> {
        let policy = self
            .currencies
            .get(&currency)
            .ok_or_else(|| config_error(format!("{} is not accepted", currency)))?;
        if expected_usd <= Decimal::ZERO {
            return Err(SettlementError::Generic(format!(
                "expected amount must be positive, got {}",
                expected_usd
            )));
        }
        // `validate` guarantees at least one wallet
        let wallet = policy.wallets.first().map(String::as_str).unwrap_or_default();
        Ok(NewFundingRequest::new(
            user_id,
            currency,
            expected_usd.round_dp(2),
            wallet,
            policy.required_confirmations,
        ))
    }
}

fn config_error(msg: impl Into<String>) -> SettlementError {
    SettlementError::Config(msg.into())
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> SettlementResult<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| SettlementError::Generic(e.to_string()))?;
    let mut result = content.to_string();

    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let var_name = &cap[1];

        if let Ok(var_value) = std::env::var(var_name) {
            result = result.replace(full_match, &var_value);
        } else {
            // Keep the placeholder if env var is not set
            warn!(
                "Environment variable {} not found, keeping placeholder",
                var_name
            );
        }
    }

    Ok(result)
}

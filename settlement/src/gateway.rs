// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Normalizes inbound transfer notifications into [`ChainEvent`]s.
//!
//! Recognized payloads:
//! - a single push with flat `txHash`/`fromAddress`/`toAddress`/`value`
//! - a batch push with `txs` and/or `erc20Transfers`, plus optional
//!   `chainId`, `confirmed` and `block.number` applying to every entry
//! - a bitcoin-style object with `hash`/`from`/`to`/`value`
//! - a polled history list, either a bare array or under `result`
//!
//! Nothing here fails the caller: unusable entries are counted and dropped.

use crate::funding::{ChainEvent, Currency};
use crate::metrics::SettlementMetrics;
use crate::ttl_cache::TtlCache;
use crate::utils::{normalize_address, normalize_hash, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_REDELIVERY_WINDOW: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub received: usize,
    pub normalized: usize,
    pub forwarded: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Ingested {
    pub report: IngestReport,
    pub events: Vec<ChainEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discard {
    Malformed,
    UnknownSymbol,
    UnresolvedSymbol,
    Unmonitored,
    Duplicate,
    Redelivery,
}

impl Discard {
    fn as_str(&self) -> &'static str {
        match self {
            Discard::Malformed => "malformed",
            Discard::UnknownSymbol => "unknown_symbol",
            Discard::UnresolvedSymbol => "unresolved_symbol",
            Discard::Unmonitored => "unmonitored",
            Discard::Duplicate => "duplicate",
            Discard::Redelivery => "redelivery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

impl StringOrNumber {
    fn into_string(self) -> String {
        match self {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }
    }
}

/// One transfer entry as found on the wire, before symbol resolution.
#[serde_as]
#[derive(Debug, Deserialize)]
struct RawTransfer {
    #[serde(alias = "txHash", alias = "transactionHash")]
    hash: String,
    #[serde(default, alias = "fromAddress")]
    from: Option<String>,
    #[serde(alias = "toAddress")]
    to: String,
    value: StringOrNumber,
    #[serde(default, alias = "tokenSymbol")]
    symbol: Option<String>,
    #[serde(default, rename = "chainId")]
    chain_id: Option<StringOrNumber>,
    #[serde(default)]
    confirmed: Option<bool>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    confirmations: Option<u64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default, rename = "blockNumber")]
    block_number: Option<u64>,
}

/// Fields a batch envelope contributes to each of its entries.
#[derive(Debug, Clone, Default)]
struct Envelope {
    chain_id: Option<String>,
    confirmed: Option<bool>,
    block_number: Option<u64>,
}

impl Envelope {
    fn from_object(map: &Map<String, Value>) -> Self {
        Self {
            chain_id: map.get("chainId").and_then(value_as_string),
            confirmed: map.get("confirmed").and_then(Value::as_bool),
            block_number: map
                .get("block")
                .and_then(|block| block.get("number"))
                .and_then(value_as_u64),
        }
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn currency_for_chain_id(chain_id: &str) -> Option<Currency> {
    match chain_id.trim().to_ascii_lowercase().as_str() {
        "0x1" | "1" => Some(Currency::Eth),
        "0x38" | "56" => Some(Currency::Bnb),
        _ => None,
    }
}

/// Flatten a payload into its transfer entries, each with its envelope.
fn collect_entries(payload: &Value) -> Vec<(&Value, Envelope)> {
    match payload {
        Value::Array(items) => items.iter().map(|v| (v, Envelope::default())).collect(),
        Value::Object(map) => {
            let envelope = Envelope::from_object(map);
            if let Some(Value::Array(items)) = map.get("result") {
                return items.iter().map(|v| (v, envelope.clone())).collect();
            }
            let mut entries = Vec::new();
            for key in ["txs", "erc20Transfers"] {
                if let Some(Value::Array(items)) = map.get(key) {
                    entries.extend(items.iter().map(|v| (v, envelope.clone())));
                }
            }
            if ["txHash", "hash", "transactionHash"]
                .iter()
                .any(|key| map.contains_key(*key))
            {
                entries.push((payload, envelope));
            }
            entries
        }
        _ => vec![(payload, Envelope::default())],
    }
}

#[derive(Debug)]
pub struct EventGateway {
    /// Normalized wallet -> currencies received there
    wallets: HashMap<String, Vec<Currency>>,
    recent: TtlCache<(String, u64), u64>,
    metrics: Arc<SettlementMetrics>,
}

impl EventGateway {
    pub fn new(
        wallets: impl IntoIterator<Item = (Currency, String)>,
        redelivery_window: Duration,
        metrics: Arc<SettlementMetrics>,
    ) -> Self {
        let mut by_wallet: HashMap<String, Vec<Currency>> = HashMap::new();
        for (currency, wallet) in wallets {
            let entry = by_wallet.entry(normalize_address(&wallet)).or_default();
            if !entry.contains(&currency) {
                entry.push(currency);
            }
        }
        Self {
            wallets: by_wallet,
            recent: TtlCache::new(redelivery_window),
            metrics,
        }
    }

    /// Monitored wallets grouped by currency
    pub fn monitored_wallets(&self) -> BTreeMap<Currency, Vec<String>> {
        let mut result: BTreeMap<Currency, Vec<String>> = BTreeMap::new();
        for (wallet, currencies) in &self.wallets {
            for currency in currencies {
                result.entry(*currency).or_default().push(wallet.clone());
            }
        }
        for wallets in result.values_mut() {
            wallets.sort();
        }
        result
    }

    pub async fn ingest(&self, payload: &Value) -> Ingested {
        let entries = collect_entries(payload);
        let mut report = IngestReport {
            received: entries.len(),
            ..Default::default()
        };
        self.metrics
            .gateway_received_events
            .inc_by(entries.len() as u64);

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for (entry, envelope) in entries {
            let event = match self.normalize(entry, &envelope) {
                Ok(event) => event,
                Err(reason) => {
                    self.discard(&mut report, reason);
                    continue;
                }
            };
            report.normalized += 1;

            let key = (event.transaction_hash.clone(), event.confirmations);
            if !seen.insert(key.clone()) {
                self.discard(&mut report, Discard::Duplicate);
                continue;
            }
            if self.recent.get_if_valid(&key).await.is_some() {
                debug!("[Gateway] Dropping redelivery of {}", event);
                self.discard(&mut report, Discard::Redelivery);
                continue;
            }
            self.recent.update(key, event.observed_at_ms).await;
            events.push(event);
        }
        self.recent.prune_expired().await;

        report.forwarded = events.len();
        self.metrics
            .gateway_forwarded_events
            .inc_by(events.len() as u64);
        debug!("[Gateway] Ingested payload: {:?}", report);
        Ingested { report, events }
    }

    /// Accept the next delivery of `event` instead of dropping it as a
    /// redelivery.
    pub async fn forget(&self, event: &ChainEvent) {
        self.recent
            .invalidate(&(event.transaction_hash.clone(), event.confirmations))
            .await;
    }

    fn discard(&self, report: &mut IngestReport, reason: Discard) {
        report.discarded += 1;
        self.metrics
            .gateway_discarded_events
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    fn normalize(&self, entry: &Value, envelope: &Envelope) -> Result<ChainEvent, Discard> {
        let raw: RawTransfer = serde_json::from_value(entry.clone()).map_err(|e| {
            warn!("[Gateway] Discarding malformed transfer entry: {}", e);
            Discard::Malformed
        })?;

        let to_address = normalize_address(&raw.to);
        let Some(currencies) = self.wallets.get(&to_address) else {
            debug!("[Gateway] Transfer {} to unmonitored {}", raw.hash, raw.to);
            return Err(Discard::Unmonitored);
        };

        let symbol = match raw.symbol.as_deref() {
            Some(symbol) => Currency::from_str(symbol).map_err(|_| {
                debug!("[Gateway] Transfer {} has unsupported symbol {}", raw.hash, symbol);
                Discard::UnknownSymbol
            })?,
            None => raw
                .chain_id
                .map(StringOrNumber::into_string)
                .or_else(|| envelope.chain_id.clone())
                .and_then(|chain_id| currency_for_chain_id(&chain_id))
                .or_else(|| match currencies.as_slice() {
                    [only] => Some(*only),
                    _ => None,
                })
                .ok_or_else(|| {
                    warn!(
                        "[Gateway] Cannot tell the currency of transfer {} to {}",
                        raw.hash, to_address
                    );
                    Discard::UnresolvedSymbol
                })?,
        };
        if !currencies.contains(&symbol) {
            debug!(
                "[Gateway] {} transfer {} to a wallet not monitored for it",
                symbol, raw.hash
            );
            return Err(Discard::Unmonitored);
        }

        let hash = normalize_hash(&raw.hash);
        if hash.is_empty() {
            return Err(Discard::Malformed);
        }
        let confirmed = raw.confirmed.or(envelope.confirmed).unwrap_or(false);
        Ok(ChainEvent {
            transaction_hash: hash,
            from_address: raw
                .from
                .as_deref()
                .map(normalize_address)
                .unwrap_or_default(),
            to_address,
            raw_value: raw.value.into_string(),
            symbol,
            confirmations: raw
                .confirmations
                .unwrap_or(if confirmed { 1 } else { 0 }),
            block_number: raw.block_number.or(envelope.block_number),
            observed_at_ms: now_ms(),
        })
    }
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::{EligibilityConfig, PriceSourceConfig, SettlementNodeConfig, SettlementPolicy};
use crate::confirmation::{
    BlockHeightSource, ConfirmationSource, FeedMode, JsonRpcBlockHeight, LiveFeed,
    PolledSimulation,
};
use crate::gateway::EventGateway;
use crate::metrics::SettlementMetrics;
use crate::pipeline::DepositPipeline;
use crate::price_oracle::{CoinMarketCapSource, PriceOracle, PriceSource, StaticPriceSource};
use crate::reaper::Reaper;
use crate::server::{handler::SettlementRequestHandler, run_server};
use crate::state_machine::{LogNotifier, SettlementStateMachine};
use crate::store::{FundingStore, InMemoryFundingStore, PgFundingStore};
use crate::store::pg::PgEligibility;
use crate::validator::{AllowAll, EligibilityCheck, TransactionValidator, VerifiedUsers};
use settlement_pg_db::{Db, DbArgs};
use settlement_schema::MIGRATIONS;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

/// Upper bound on retrying one chain-head poll
const HEAD_POLL_MAX_ELAPSED: Duration = Duration::from_secs(20);

/// Wired components of a running node
pub struct SettlementComponents {
    pub pipeline: Arc<DepositPipeline>,
    pub reaper: Arc<Reaper>,
    pub feed_mode: FeedMode,
}

pub async fn run_settlement_node(
    config: SettlementNodeConfig,
    prometheus_registry: prometheus::Registry,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let metrics = Arc::new(SettlementMetrics::new(&prometheus_registry));
    let policy = config.validate()?;
    let components = build_components(&policy, metrics.clone()).await?;

    let reaper_handle = components.reaper.clone().start(cancel.clone());

    let socket_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        policy.server_listen_port,
    );
    let server_handle = run_server(
        &socket_address,
        SettlementRequestHandler::new(components.pipeline.clone(), components.feed_mode),
        metrics,
        prometheus_registry,
        cancel,
    )
    .await?;

    Ok(tokio::spawn(async move {
        let (server, reaper) = futures::future::join(server_handle, reaper_handle).await;
        if let Err(e) = server {
            error!("Server task failed: {:?}", e);
        }
        if let Err(e) = reaper {
            error!("Reaper task failed: {:?}", e);
        }
        info!("Settlement node stopped");
    }))
}

pub async fn build_components(
    policy: &SettlementPolicy,
    metrics: Arc<SettlementMetrics>,
) -> anyhow::Result<SettlementComponents> {
    let (store, db) = open_store(policy).await?;
    let eligibility = eligibility(policy, db)?;

    let source = price_source(&policy.price_source)?;
    info!("Using price source {}", source.name());
    let oracle = Arc::new(PriceOracle::new(
        source,
        policy.pricing(),
        policy.price_cache_freshness,
        metrics.clone(),
    ));

    let gateway = Arc::new(EventGateway::new(
        policy.monitored_wallets(),
        policy.redelivery_window,
        metrics.clone(),
    ));
    let validator = TransactionValidator::new(
        store.clone(),
        oracle.clone(),
        eligibility,
        policy.tolerance_percent,
    );
    let machine = Arc::new(SettlementStateMachine::new(
        store.clone(),
        Arc::new(policy.tiers.clone()),
        Arc::new(LogNotifier),
        metrics.clone(),
    ));
    let pipeline = Arc::new(DepositPipeline::new(
        gateway,
        validator,
        machine,
        store,
        policy.max_observation_window,
        metrics.clone(),
    ));

    let confirmations = confirmation_source(policy, oracle)?;
    let reaper = Arc::new(Reaper::new(
        pipeline.clone(),
        confirmations,
        policy.max_observation_window,
        policy.reaper_interval,
        metrics,
    ));

    Ok(SettlementComponents {
        pipeline,
        reaper,
        feed_mode: policy.feed_mode,
    })
}

/// Postgres-backed store when a database is configured, in-memory otherwise.
pub async fn open_store(
    policy: &SettlementPolicy,
) -> anyhow::Result<(Arc<dyn FundingStore>, Option<Db>)> {
    match &policy.database_url {
        Some(database_url) => {
            let db = Db::for_write(Url::parse(database_url)?, DbArgs::default()).await?;
            db.run_migrations(&MIGRATIONS).await?;
            Ok((Arc::new(PgFundingStore::new(db.clone())), Some(db)))
        }
        None => {
            warn!("No database-url configured, funding requests are kept in memory");
            let store = InMemoryFundingStore::new();
            for seed in &policy.seed_requests {
                let request = store.create(seed.clone()).await?;
                info!(
                    "Seeded funding request {} for user {}: ${} in {} to {}",
                    request.id,
                    request.user_id,
                    request.expected_usd,
                    request.currency,
                    request.wallet_address
                );
            }
            Ok((Arc::new(store), None))
        }
    }
}

fn eligibility(
    policy: &SettlementPolicy,
    db: Option<Db>,
) -> anyhow::Result<Arc<dyn EligibilityCheck>> {
    Ok(match &policy.eligibility {
        EligibilityConfig::AllowAll => Arc::new(AllowAll),
        EligibilityConfig::VerifiedUsers { users } => {
            Arc::new(VerifiedUsers::new(users.iter().copied()))
        }
        EligibilityConfig::Database => {
            let db = db.ok_or_else(|| {
                anyhow::anyhow!("database eligibility needs a configured database")
            })?;
            Arc::new(PgEligibility::new(db))
        }
    })
}

fn price_source(config: &PriceSourceConfig) -> anyhow::Result<Arc<dyn PriceSource>> {
    Ok(match config {
        PriceSourceConfig::CoinMarketCap { api_key, base_url } => Arc::new(
            CoinMarketCapSource::new(api_key.clone(), base_url.clone())?,
        ),
        PriceSourceConfig::Static { prices } => Arc::new(StaticPriceSource::new(
            prices.iter().map(|(symbol, price)| (symbol.clone(), *price)),
        )),
    })
}

fn confirmation_source(
    policy: &SettlementPolicy,
    oracle: Arc<PriceOracle>,
) -> anyhow::Result<Arc<dyn ConfirmationSource>> {
    match policy.feed_mode {
        FeedMode::Simulated => {
            warn!("Confirmation feed is simulated: transfers are fabricated for pending requests");
            Ok(Arc::new(PolledSimulation::new(
                oracle,
                policy.simulation_timings(),
            )))
        }
        FeedMode::Live => {
            let mut heights: HashMap<_, Arc<dyn BlockHeightSource>> = HashMap::new();
            for (currency, currency_policy) in &policy.currencies {
                let Some(url) = &currency_policy.rpc_url else {
                    continue;
                };
                let source = JsonRpcBlockHeight::new(
                    url.clone(),
                    currency_policy.rpc_method.clone(),
                    currency_policy.timing.block_time / 2,
                    HEAD_POLL_MAX_ELAPSED,
                )?;
                info!("{} chain head polled from {}", currency, url);
                heights.insert(*currency, Arc::new(source));
            }
            Ok(Arc::new(LiveFeed::new(heights)))
        }
    }
}

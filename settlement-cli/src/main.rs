// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use deposit_settlement::config::SettlementNodeConfig;
use deposit_settlement::node::run_settlement_node;
use settlement_cli::{
    generate_config_template_and_write_to_file, print_json, Args, LoadedLedger, SettlementCommand,
};
use settlement_config::Config;
use settlement_pg_db::{reset_database, Db};
use settlement_schema::MIGRATIONS;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    match args.command {
        SettlementCommand::Run { config_path } => {
            let config = SettlementNodeConfig::load(&config_path)?;
            let prometheus_registry = prometheus::Registry::new();
            let cancel = CancellationToken::new();

            let handle = run_settlement_node(config, prometheus_registry, cancel.clone()).await?;
            tokio::signal::ctrl_c().await?;
            info!("Shutting down settlement node");
            cancel.cancel();
            handle
                .await
                .map_err(|e| anyhow::anyhow!("Task join error: {}", e))?;
        }
        SettlementCommand::CreateConfigTemplate { path } => {
            generate_config_template_and_write_to_file(&path)?;
            info!("Settlement node config template generated at {}", path.display());
        }
        SettlementCommand::Migrate {
            database_url,
            reset,
            db_args,
        } => {
            if reset {
                reset_database(database_url, db_args, &MIGRATIONS).await?;
                info!("Database reset and migrated");
            } else {
                let db = Db::for_write(database_url, db_args).await?;
                db.run_migrations(&MIGRATIONS).await?;
                info!("Database migrated");
            }
        }
        SettlementCommand::CreateRequest {
            config_path,
            user_id,
            currency,
            expected_usd,
        } => {
            let ledger = LoadedLedger::load(&config_path).await?;
            let request = ledger
                .policy
                .funding_request(user_id, currency, expected_usd)?;
            let request = ledger.store.create(request).await?;
            info!(
                "Funding request {} created, pay {} into {}",
                request.id, request.currency, request.wallet_address
            );
            print_json(&request)?;
        }
        SettlementCommand::CancelRequest { config_path, id } => {
            let ledger = LoadedLedger::load(&config_path).await?;
            if ledger.state_machine().cancel(id).await? {
                info!("Funding request {} cancelled", id);
            } else {
                anyhow::bail!("Funding request {} is past the point of cancellation", id);
            }
        }
        SettlementCommand::ShowRequest { config_path, id } => {
            let ledger = LoadedLedger::load(&config_path).await?;
            match ledger.store.get(id).await? {
                Some(request) => print_json(&request)?,
                None => anyhow::bail!("Funding request {} not found", id),
            }
        }
        SettlementCommand::ShowLedger {
            config_path,
            user_id,
        } => {
            let ledger = LoadedLedger::load(&config_path).await?;
            match ledger.store.ledger(user_id).await? {
                Some(user_ledger) => print_json(&user_ledger)?,
                None => anyhow::bail!("User {} has no ledger yet", user_id),
            }
        }
    }
    Ok(())
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::{anyhow, bail};
use clap::*;
use deposit_settlement::config::{SettlementNodeConfig, SettlementPolicy};
use deposit_settlement::funding::Currency;
use deposit_settlement::metrics::SettlementMetrics;
use deposit_settlement::node::open_store;
use deposit_settlement::state_machine::{LogNotifier, SettlementStateMachine};
use deposit_settlement::store::FundingStore;
use rust_decimal::Decimal;
use settlement_config::Config;
use settlement_pg_db::DbArgs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = "settlement-node")]
#[clap(version)]
pub struct Args {
    #[clap(subcommand)]
    pub command: SettlementCommand,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum SettlementCommand {
    // Run the webhook server and the reaper until ctrl-c
    #[clap(name = "run")]
    Run {
        #[clap(long = "config-path")]
        config_path: PathBuf,
    },
    #[clap(name = "create-config-template")]
    CreateConfigTemplate { path: PathBuf },
    // Apply embedded migrations; `--reset` reverts them first, emptying the ledger tables
    #[clap(name = "migrate")]
    Migrate {
        #[clap(long = "database-url", env = "DATABASE_URL")]
        database_url: Url,
        #[clap(long = "reset")]
        reset: bool,
        #[command(flatten)]
        db_args: DbArgs,
    },
    // Open a pending funding request against the configured database
    #[clap(name = "create-request")]
    CreateRequest {
        #[clap(long = "config-path")]
        config_path: PathBuf,
        #[clap(long = "user")]
        user_id: u64,
        #[clap(long = "currency")]
        currency: Currency,
        #[clap(long = "usd")]
        expected_usd: Decimal,
    },
    #[clap(name = "cancel-request")]
    CancelRequest {
        #[clap(long = "config-path")]
        config_path: PathBuf,
        #[clap(long = "id")]
        id: u64,
    },
    #[clap(name = "show-request")]
    ShowRequest {
        #[clap(long = "config-path")]
        config_path: PathBuf,
        #[clap(long = "id")]
        id: u64,
    },
    #[clap(name = "show-ledger")]
    ShowLedger {
        #[clap(long = "config-path")]
        config_path: PathBuf,
        #[clap(long = "user")]
        user_id: u64,
    },
}

/// Policy and Postgres store of a node, for the offline commands.
pub struct LoadedLedger {
    pub policy: SettlementPolicy,
    pub store: Arc<dyn FundingStore>,
}

impl LoadedLedger {
    pub async fn load(config_path: &Path) -> anyhow::Result<Self> {
        let policy = SettlementNodeConfig::load(config_path)?.validate()?;
        if policy.database_url.is_none() {
            bail!(
                "{} has no database-url, requests only live inside a running node",
                config_path.display()
            );
        }
        let (store, _) = open_store(&policy).await?;
        Ok(Self { policy, store })
    }

    pub fn state_machine(&self) -> SettlementStateMachine {
        SettlementStateMachine::new(
            self.store.clone(),
            Arc::new(self.policy.tiers.clone()),
            Arc::new(LogNotifier),
            Arc::new(SettlementMetrics::new_for_testing()),
        )
    }
}

pub fn generate_config_template_and_write_to_file(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        return Err(anyhow!("{} already exists", path.display()));
    }
    SettlementNodeConfig::template().save(path)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deposit_settlement::config::PriceSourceConfig;
    use std::str::FromStr;

    #[test]
    fn test_parse_create_request() {
        let args = Args::try_parse_from([
            "settlement-node",
            "create-request",
            "--config-path",
            "node.yaml",
            "--user",
            "7",
            "--currency",
            "usdt",
            "--usd",
            "1000.50",
        ])
        .unwrap();
        match args.command {
            SettlementCommand::CreateRequest {
                user_id,
                currency,
                expected_usd,
                ..
            } => {
                assert_eq!(user_id, 7);
                assert_eq!(currency, Currency::Usdt);
                assert_eq!(expected_usd, Decimal::from_str("1000.50").unwrap());
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Args::try_parse_from([
            "settlement-node",
            "create-request",
            "--config-path",
            "node.yaml",
            "--user",
            "7",
            "--currency",
            "doge",
            "--usd",
            "1",
        ])
        .is_err());
    }

    #[test]
    fn test_parse_migrate() {
        let args = Args::try_parse_from([
            "settlement-node",
            "migrate",
            "--database-url",
            "postgres://postgres@localhost:5432/settlement",
            "--reset",
            "--db-connection-pool-size",
            "2",
        ])
        .unwrap();
        match args.command {
            SettlementCommand::Migrate { reset, db_args, .. } => {
                assert!(reset);
                assert_eq!(db_args.db_connection_pool_size, 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_config_template_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        generate_config_template_and_write_to_file(&path).unwrap();
        let loaded = SettlementNodeConfig::load(&path).unwrap();
        assert_eq!(loaded, SettlementNodeConfig::template());
        assert!(generate_config_template_and_write_to_file(&path).is_err());
    }

    #[tokio::test]
    async fn test_ledger_needs_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let mut config = SettlementNodeConfig::template();
        config.price_source = PriceSourceConfig::Static {
            prices: [("USDT".to_string(), Decimal::ONE)].into_iter().collect(),
        };
        config.save(&path).unwrap();
        let err = LoadedLedger::load(&path).await.err().unwrap();
        assert!(err.to_string().contains("database-url"));
    }
}

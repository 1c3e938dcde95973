// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Connection pool and migration runner for the funding ledger database.
//!
//! The ledger tables live next to the application's own tables, so every
//! destructive operation here goes through the embedded migrations and never
//! touches tables it did not create.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use anyhow::anyhow;
use diesel::migration::{self, Migration, MigrationSource, MigrationVersion};
use diesel::pg::Pg;
use diesel::ConnectionError;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::ManagerConfig;
use diesel_async::{
    pooled_connection::{
        bb8::{Pool, PooledConnection},
        AsyncDieselConnectionManager,
    },
    AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};
use futures::FutureExt;
use tracing::info;
use url::Url;

type Harness = AsyncConnectionWrapper<AsyncPgConnection>;

/// Diesel implements `MigrationSource` for owned `EmbeddedMigrations` only.
#[derive(Clone, Copy)]
struct StaticMigrations(&'static EmbeddedMigrations);

impl MigrationSource<Pg> for StaticMigrations {
    fn migrations(&self) -> migration::Result<Vec<Box<dyn Migration<Pg>>>> {
        MigrationSource::<Pg>::migrations(self.0)
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct DbArgs {
    // Connections kept by the pool. Webhook handlers and the reaper share it.
    #[arg(long, default_value_t = Self::default().db_connection_pool_size)]
    pub db_connection_pool_size: u32,

    // Wait for a free pooled connection, in milliseconds.
    #[arg(long, default_value_t = Self::default().db_connection_timeout_ms)]
    pub db_connection_timeout_ms: u64,

    // Per-statement timeout applied to every pooled connection, in milliseconds.
    #[arg(long)]
    pub db_statement_timeout_ms: Option<u64>,
}

impl Default for DbArgs {
    fn default() -> Self {
        Self {
            db_connection_pool_size: 10,
            db_connection_timeout_ms: 30_000,
            db_statement_timeout_ms: None,
        }
    }
}

impl DbArgs {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.db_connection_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.db_statement_timeout_ms.map(Duration::from_millis)
    }
}

/// Shared pool; clones hand out connections from the same pool.
#[derive(Clone)]
pub struct Db {
    pool: Pool<AsyncPgConnection>,
    database_url: String,
}

pub struct Connection<'a>(PooledConnection<'a, AsyncPgConnection>);

impl Db {
    pub async fn for_write(database_url: Url, args: DbArgs) -> anyhow::Result<Self> {
        let pool = pool(&database_url, &args).await?;
        Ok(Self {
            pool,
            database_url: database_url.to_string(),
        })
    }

    /// Fails once [`DbArgs::connection_timeout`] has elapsed without a free connection.
    pub async fn connect(&self) -> anyhow::Result<Connection<'_>> {
        Ok(Connection(self.pool.get().await?))
    }

    pub fn state(&self) -> bb8::State {
        self.pool.state()
    }

    pub async fn run_migrations(
        &self,
        migrations: &'static EmbeddedMigrations,
    ) -> anyhow::Result<Vec<MigrationVersion<'static>>> {
        let source = StaticMigrations(migrations);
        let applied = self
            .with_harness(move |harness| harness.run_pending_migrations(source))
            .await?
            .map_err(|e| anyhow!("Failed to run migrations: {}", e))?;
        info!("Applied {} ledger migration(s)", applied.len());
        Ok(applied)
    }

    /// Runs every `down.sql`, newest first.
    pub async fn revert_migrations(
        &self,
        migrations: &'static EmbeddedMigrations,
    ) -> anyhow::Result<Vec<MigrationVersion<'static>>> {
        let source = StaticMigrations(migrations);
        let reverted = self
            .with_harness(move |harness| harness.revert_all_migrations(source))
            .await?
            .map_err(|e| anyhow!("Failed to revert migrations: {}", e))?;
        info!("Reverted {} ledger migration(s)", reverted.len());
        Ok(reverted)
    }

    // Diesel's migration harness is synchronous: it gets its own connection
    // on the blocking pool.
    async fn with_harness<F, E>(
        &self,
        f: F,
    ) -> anyhow::Result<Result<Vec<MigrationVersion<'static>>, E>>
    where
        F: FnOnce(&mut Harness) -> Result<Vec<MigrationVersion<'_>>, E> + Send + 'static,
        E: Send + 'static,
    {
        let conn = AsyncPgConnection::establish(&self.database_url)
            .await
            .map_err(|e| anyhow!("Failed to connect for migrations: {}", e))?;
        let mut harness: Harness = conn.into();
        Ok(tokio::task::spawn_blocking(move || {
            f(&mut harness)
                .map(|versions| versions.iter().map(MigrationVersion::as_owned).collect())
        })
        .await?)
    }
}

/// Reverts and re-applies `migrations`, leaving empty ledger tables.
pub async fn reset_database(
    database_url: Url,
    args: DbArgs,
    migrations: &'static EmbeddedMigrations,
) -> anyhow::Result<Db> {
    let db = Db::for_write(database_url, args).await?;
    db.revert_migrations(migrations).await?;
    db.run_migrations(migrations).await?;
    Ok(db)
}

impl<'a> Deref for Connection<'a> {
    type Target = PooledConnection<'a, AsyncPgConnection>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Connection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

async fn pool(database_url: &Url, args: &DbArgs) -> anyhow::Result<Pool<AsyncPgConnection>> {
    let statement_timeout = args.statement_timeout();
    let mut config = ManagerConfig::default();
    config.custom_setup = Box::new(move |url| {
        async move {
            let mut conn = AsyncPgConnection::establish(url).await?;
            if let Some(timeout) = statement_timeout {
                diesel::sql_query(format!("SET statement_timeout = {}", timeout.as_millis()))
                    .execute(&mut conn)
                    .await
                    .map_err(ConnectionError::CouldntSetupConfiguration)?;
            }
            Ok(conn)
        }
        .boxed()
    });

    let manager = AsyncDieselConnectionManager::new_with_config(database_url.as_str(), config);
    Ok(Pool::builder()
        .max_size(args.db_connection_pool_size)
        .connection_timeout(args.connection_timeout())
        .build(manager)
        .await?)
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL ledger.
//!
//! Status CAS is a conditional `UPDATE ... WHERE status = $from`. Hash
//! ownership is enforced by the unique index on `observed_chain_hash`, and
//! `settle` runs as one transaction holding row locks on the request and the
//! user's ledger.

use super::{check_transition, FundingStore, StoreError, StoreResult};
use crate::funding::{
    Currency, FundingRequest, FundingStatus, NewFundingRequest, Observation, ObserveOutcome,
    SettleOutcome, Settlement, UserLedger,
};
use crate::utils::{normalize_address, now_ms};
use crate::validator::EligibilityCheck;
use crate::yield_tier::YieldTierTable;
use async_trait::async_trait;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{BoolExpressionMethods, ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use settlement_pg_db::{Connection, Db};
use settlement_schema::models::{FundingRequestRow, NewFundingRequestRow, UserLedgerRow};
use settlement_schema::schema::{funding_requests, user_ledgers, user_verifications};
use std::str::FromStr;
use tracing::debug;

diesel::define_sql_function!(fn greatest(a: diesel::sql_types::BigInt, b: diesel::sql_types::BigInt) -> diesel::sql_types::BigInt);

const IN_FLIGHT: [&str; 3] = ["pending", "chain_observed", "confirmed"];

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                StoreError::Unavailable(info.message().to_string())
            }
            other => StoreError::Internal(other.to_string()),
        }
    }
}

fn is_unique_violation(err: &DieselError) -> bool {
    matches!(
        err,
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

fn to_i64(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} does not fit in BIGINT", value)))
}

fn to_u64(value: i64, field: &str) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {}: {}", field, value)))
}

impl TryFrom<FundingRequestRow> for FundingRequest {
    type Error = StoreError;

    fn try_from(row: FundingRequestRow) -> StoreResult<Self> {
        Ok(FundingRequest {
            id: to_u64(row.id, "id")?,
            user_id: to_u64(row.user_id, "user_id")?,
            currency: Currency::from_str(&row.currency)
                .map_err(|_| StoreError::Corrupt(format!("unknown currency {}", row.currency)))?,
            expected_usd: row.expected_usd,
            wallet_address: row.wallet_address,
            observed_chain_hash: row.observed_chain_hash,
            observed_confirmations: to_u64(row.observed_confirmations, "observed_confirmations")?,
            observed_block_number: row
                .observed_block_number
                .map(|block| to_u64(block, "observed_block_number"))
                .transpose()?,
            required_confirmations: to_u64(row.required_confirmations, "required_confirmations")?,
            actual_usd: row.actual_usd,
            status: parse_status(&row.status)?,
            failure_reason: row.failure_reason,
            created_at_ms: to_u64(row.created_at_ms, "created_at_ms")?,
            updated_at_ms: to_u64(row.updated_at_ms, "updated_at_ms")?,
        })
    }
}

impl TryFrom<UserLedgerRow> for UserLedger {
    type Error = StoreError;

    fn try_from(row: UserLedgerRow) -> StoreResult<Self> {
        Ok(UserLedger {
            user_id: to_u64(row.user_id, "user_id")?,
            total_invested: row.total_invested,
            current_balance: row.current_balance,
            daily_yield_rate: row.daily_yield_rate,
            last_yield_update_ms: row
                .last_yield_update_ms
                .map(|ms| to_u64(ms, "last_yield_update_ms"))
                .transpose()?,
        })
    }
}

fn parse_status(status: &str) -> StoreResult<FundingStatus> {
    FundingStatus::from_str(status)
        .map_err(|_| StoreError::Corrupt(format!("unknown status {}", status)))
}

#[derive(Clone)]
pub struct PgFundingStore {
    db: Db,
}

impl std::fmt::Debug for PgFundingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgFundingStore")
            .field("pool", &self.db.state())
            .finish()
    }
}

impl PgFundingStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn connect(&self) -> StoreResult<Connection<'_>> {
        self.db
            .connect()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn current_status(&self, id: u64) -> StoreResult<FundingStatus> {
        let mut conn = self.connect().await?;
        let status: Option<String> = funding_requests::table
            .filter(funding_requests::id.eq(to_i64(id)?))
            .select(funding_requests::status)
            .first(&mut conn)
            .await
            .optional()?;
        match status {
            Some(status) => parse_status(&status),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl FundingStore for PgFundingStore {
    async fn create(&self, request: NewFundingRequest) -> StoreResult<FundingRequest> {
        let row = NewFundingRequestRow {
            user_id: to_i64(request.user_id)?,
            currency: request.currency.to_string(),
            expected_usd: request.expected_usd,
            wallet_address: request.wallet_address,
            required_confirmations: to_i64(request.required_confirmations)?,
            status: FundingStatus::Pending.as_str().to_string(),
            created_at_ms: to_i64(request.created_at_ms)?,
            updated_at_ms: to_i64(request.created_at_ms)?,
        };
        let mut conn = self.connect().await?;
        let inserted: FundingRequestRow = diesel::insert_into(funding_requests::table)
            .values(&row)
            .returning(FundingRequestRow::as_returning())
            .get_result(&mut conn)
            .await?;
        inserted.try_into()
    }

    async fn get(&self, id: u64) -> StoreResult<Option<FundingRequest>> {
        let mut conn = self.connect().await?;
        funding_requests::table
            .filter(funding_requests::id.eq(to_i64(id)?))
            .select(FundingRequestRow::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(FundingRequest::try_from)
            .transpose()
    }

    async fn find_pending_by_wallet(
        &self,
        wallet: &str,
        currency: Currency,
    ) -> StoreResult<Option<FundingRequest>> {
        let mut conn = self.connect().await?;
        funding_requests::table
            .filter(funding_requests::wallet_address.eq(normalize_address(wallet)))
            .filter(funding_requests::currency.eq(currency.as_ref()))
            .filter(funding_requests::status.eq(FundingStatus::Pending.as_str()))
            .order((
                funding_requests::created_at_ms.asc(),
                funding_requests::id.asc(),
            ))
            .select(FundingRequestRow::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(FundingRequest::try_from)
            .transpose()
    }

    async fn find_by_hash(&self, hash: &str) -> StoreResult<Option<FundingRequest>> {
        let mut conn = self.connect().await?;
        funding_requests::table
            .filter(funding_requests::observed_chain_hash.eq(hash))
            .select(FundingRequestRow::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(FundingRequest::try_from)
            .transpose()
    }

    async fn attach_observation(
        &self,
        id: u64,
        hash: &str,
        confirmations: u64,
    ) -> StoreResult<bool> {
        let mut conn = self.connect().await?;
        let updated = diesel::update(
            funding_requests::table
                .filter(funding_requests::id.eq(to_i64(id)?))
                .filter(funding_requests::status.eq_any(IN_FLIGHT))
                .filter(
                    funding_requests::observed_chain_hash
                        .is_null()
                        .or(funding_requests::observed_chain_hash.eq(hash)),
                ),
        )
        .set((
            funding_requests::observed_chain_hash.eq(hash),
            funding_requests::observed_confirmations.eq(greatest(
                funding_requests::observed_confirmations,
                to_i64(confirmations)?,
            )),
            funding_requests::updated_at_ms.eq(to_i64(now_ms())?),
        ))
        .execute(&mut conn)
        .await;
        match updated {
            Ok(rows) => Ok(rows == 1),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn transition(
        &self,
        id: u64,
        from: FundingStatus,
        to: FundingStatus,
        reason: Option<&str>,
    ) -> StoreResult<bool> {
        check_transition(from, to)?;
        let failure_reason = reason.filter(|_| to == FundingStatus::Failed);
        let mut conn = self.connect().await?;
        let rows = diesel::update(
            funding_requests::table
                .filter(funding_requests::id.eq(to_i64(id)?))
                .filter(funding_requests::status.eq(from.as_str())),
        )
        .set((
            funding_requests::status.eq(to.as_str()),
            funding_requests::failure_reason.eq(failure_reason),
            funding_requests::updated_at_ms.eq(to_i64(now_ms())?),
        ))
        .execute(&mut conn)
        .await?;
        if rows == 0 {
            // distinguishes a lost race from an unknown id
            self.current_status(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn observe(&self, id: u64, observation: Observation) -> StoreResult<ObserveOutcome> {
        let block_number = observation.block_number.map(to_i64).transpose()?;
        let mut conn = self.connect().await?;
        let updated = diesel::update(
            funding_requests::table
                .filter(funding_requests::id.eq(to_i64(id)?))
                .filter(funding_requests::status.eq(FundingStatus::Pending.as_str()))
                .filter(
                    funding_requests::observed_chain_hash
                        .is_null()
                        .or(funding_requests::observed_chain_hash.eq(&observation.chain_hash)),
                ),
        )
        .set((
            funding_requests::observed_chain_hash.eq(&observation.chain_hash),
            funding_requests::observed_confirmations.eq(greatest(
                funding_requests::observed_confirmations,
                to_i64(observation.confirmations)?,
            )),
            funding_requests::observed_block_number.eq(block_number),
            funding_requests::actual_usd.eq(observation.actual_usd),
            funding_requests::status.eq(FundingStatus::ChainObserved.as_str()),
            funding_requests::updated_at_ms.eq(to_i64(now_ms())?),
        ))
        .returning(FundingRequestRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional();
        drop(conn);

        match updated {
            Ok(Some(row)) => Ok(ObserveOutcome::Observed(row.try_into()?)),
            Ok(None) => Ok(ObserveOutcome::StatusMismatch(self.current_status(id).await?)),
            Err(e) if is_unique_violation(&e) => {
                let owner = self
                    .find_by_hash(&observation.chain_hash)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Internal(format!(
                            "hash {} rejected as taken but has no owner",
                            observation.chain_hash
                        ))
                    })?;
                Ok(ObserveOutcome::HashTaken(owner.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn settle(&self, id: u64, tiers: &YieldTierTable) -> StoreResult<SettleOutcome> {
        let row_id = to_i64(id)?;
        let mut conn = self.connect().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let row: FundingRequestRow = funding_requests::table
                    .filter(funding_requests::id.eq(row_id))
                    .for_update()
                    .select(FundingRequestRow::as_select())
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or(StoreError::NotFound(id))?;
                let request = FundingRequest::try_from(row)?;
                if request.status != FundingStatus::Confirmed {
                    return Ok(SettleOutcome::NotSettled(request.status));
                }
                let credited_usd = request.actual_usd.ok_or_else(|| {
                    StoreError::Corrupt(format!("confirmed request {} has no actual amount", id))
                })?;
                let user_id = to_i64(request.user_id)?;

                diesel::insert_into(user_ledgers::table)
                    .values(user_ledgers::user_id.eq(user_id))
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;
                let ledger: UserLedgerRow = user_ledgers::table
                    .filter(user_ledgers::user_id.eq(user_id))
                    .for_update()
                    .select(UserLedgerRow::as_select())
                    .first(conn)
                    .await?;

                let total_invested = ledger.total_invested + credited_usd;
                let current_balance = ledger.current_balance + credited_usd;
                let ledger: UserLedgerRow = diesel::update(
                    user_ledgers::table.filter(user_ledgers::user_id.eq(user_id)),
                )
                .set((
                    user_ledgers::total_invested.eq(total_invested),
                    user_ledgers::current_balance.eq(current_balance),
                    user_ledgers::daily_yield_rate.eq(tiers.rate_for(total_invested)),
                ))
                .returning(UserLedgerRow::as_returning())
                .get_result(conn)
                .await?;

                diesel::update(funding_requests::table.filter(funding_requests::id.eq(row_id)))
                    .set((
                        funding_requests::status.eq(FundingStatus::Settled.as_str()),
                        funding_requests::updated_at_ms.eq(to_i64(now_ms())?),
                    ))
                    .execute(conn)
                    .await?;

                debug!("[PgFundingStore] Settled request {} for user {}", id, user_id);
                Ok(SettleOutcome::Settled(Settlement {
                    request_id: id,
                    user_id: request.user_id,
                    currency: request.currency,
                    chain_hash: request.observed_chain_hash,
                    credited_usd,
                    ledger: ledger.try_into()?,
                }))
            }
            .scope_boxed()
        })
        .await
    }

    async fn list_in_flight(&self) -> StoreResult<Vec<FundingRequest>> {
        let mut conn = self.connect().await?;
        let rows: Vec<FundingRequestRow> = funding_requests::table
            .filter(funding_requests::status.eq_any(IN_FLIGHT))
            .order((
                funding_requests::created_at_ms.asc(),
                funding_requests::id.asc(),
            ))
            .select(FundingRequestRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(FundingRequest::try_from).collect()
    }

    async fn count_by_status(&self, status: FundingStatus) -> StoreResult<u64> {
        let mut conn = self.connect().await?;
        let count: i64 = funding_requests::table
            .filter(funding_requests::status.eq(status.as_str()))
            .count()
            .get_result(&mut conn)
            .await?;
        to_u64(count, "count")
    }

    async fn ledger(&self, user_id: u64) -> StoreResult<Option<UserLedger>> {
        let mut conn = self.connect().await?;
        user_ledgers::table
            .filter(user_ledgers::user_id.eq(to_i64(user_id)?))
            .select(UserLedgerRow::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .map(UserLedger::try_from)
            .transpose()
    }
}

/// Eligibility backed by the `user_verifications` table. Unknown users are
/// not eligible.
#[derive(Clone)]
pub struct PgEligibility {
    db: Db,
}

impl PgEligibility {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl std::fmt::Debug for PgEligibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PgEligibility")
    }
}

#[async_trait]
impl EligibilityCheck for PgEligibility {
    async fn is_eligible(&self, user_id: u64) -> anyhow::Result<bool> {
        let mut conn = self.db.connect().await?;
        let verified: Option<bool> = user_verifications::table
            .filter(user_verifications::user_id.eq(to_i64(user_id)?))
            .select(user_verifications::is_verified)
            .first(&mut conn)
            .await
            .optional()?;
        Ok(verified.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{eth_request, observation};
    use rust_decimal_macros::dec;
    use settlement_pg_db::{reset_database, DbArgs};
    use url::Url;

    async fn test_store() -> PgFundingStore {
        let url: Url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL environment variable must be set")
            .parse()
            .expect("Invalid database URL format");
        let db = reset_database(url, DbArgs::default(), &settlement_schema::MIGRATIONS)
            .await
            .unwrap();
        PgFundingStore::new(db)
    }

    #[test]
    fn test_row_conversion_rejects_corrupt_rows() {
        let row = FundingRequestRow {
            id: 1,
            user_id: 2,
            currency: "ETH".to_string(),
            expected_usd: dec!(1000),
            wallet_address: "0xabc".to_string(),
            observed_chain_hash: None,
            observed_confirmations: 0,
            observed_block_number: None,
            required_confirmations: 12,
            actual_usd: None,
            status: "chain_observed".to_string(),
            failure_reason: None,
            created_at_ms: 10,
            updated_at_ms: 10,
        };
        let request = FundingRequest::try_from(row.clone()).unwrap();
        assert_eq!(request.status, FundingStatus::ChainObserved);
        assert_eq!(request.currency, Currency::Eth);

        let bad_status = FundingRequestRow {
            status: "cancelled".to_string(),
            ..row.clone()
        };
        assert!(matches!(
            FundingRequest::try_from(bad_status),
            Err(StoreError::Corrupt(_))
        ));
        let negative = FundingRequestRow {
            observed_confirmations: -1,
            ..row
        };
        assert!(matches!(
            FundingRequest::try_from(negative),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    async fn test_pg_lifecycle() {
        let store = test_store().await;
        let tiers = YieldTierTable::default();

        let first = store.create(eth_request(5, dec!(400))).await.unwrap();
        let second = store.create(eth_request(5, dec!(300))).await.unwrap();
        let found = store
            .find_pending_by_wallet(&first.wallet_address, Currency::Eth)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);

        let outcome = store
            .observe(first.id, observation("0xpg1", 12, dec!(400)))
            .await
            .unwrap();
        assert!(matches!(outcome, ObserveOutcome::Observed(_)));
        assert_eq!(
            store
                .observe(second.id, observation("0xpg1", 12, dec!(300)))
                .await
                .unwrap(),
            ObserveOutcome::HashTaken(first.id)
        );

        assert!(store
            .transition(
                first.id,
                FundingStatus::ChainObserved,
                FundingStatus::Confirmed,
                None
            )
            .await
            .unwrap());
        assert!(matches!(
            store.settle(first.id, &tiers).await.unwrap(),
            SettleOutcome::Settled(_)
        ));
        assert_eq!(
            store.settle(first.id, &tiers).await.unwrap(),
            SettleOutcome::NotSettled(FundingStatus::Settled)
        );

        let ledger = store.ledger(5).await.unwrap().unwrap();
        assert_eq!(ledger.total_invested, dec!(400));
        assert_eq!(ledger.daily_yield_rate, dec!(1.5));
        assert!(store.is_hash_settled("0xpg1").await.unwrap());
        assert_eq!(store.list_in_flight().await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    async fn test_pg_concurrent_settle_credits_once() {
        let store = std::sync::Arc::new(test_store().await);
        let tiers = std::sync::Arc::new(YieldTierTable::default());
        let request = store.create(eth_request(9, dec!(1000))).await.unwrap();
        store
            .observe(request.id, observation("0xpg2", 12, dec!(1000)))
            .await
            .unwrap();
        store
            .transition(
                request.id,
                FundingStatus::ChainObserved,
                FundingStatus::Confirmed,
                None,
            )
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let tiers = tiers.clone();
                tokio::spawn(async move { store.settle(request.id, &tiers).await.unwrap() })
            })
            .collect();
        let settled = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|o| matches!(o.as_ref().unwrap(), SettleOutcome::Settled(_)))
            .count();
        assert_eq!(settled, 1);
        assert_eq!(
            store.ledger(9).await.unwrap().unwrap().total_invested,
            dec!(1000)
        );
    }
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Funding request ledger.
//!
//! Every status change goes through a compare-and-swap on the current status,
//! and `settle` performs the `confirmed -> settled` swap together with the
//! ledger credit as one atomic step. These two primitives and permanent hash
//! ownership are the only idempotency boundary of the pipeline.

use crate::funding::{
    Currency, FundingRequest, FundingStatus, NewFundingRequest, Observation, ObserveOutcome,
    SettleOutcome, UserLedger,
};
use crate::yield_tier::YieldTierTable;
use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;

pub mod memory;
pub mod pg;

pub use memory::InMemoryFundingStore;
pub use pg::PgFundingStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Funding request {0} not found")]
    NotFound(u64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: FundingStatus,
        to: FundingStatus,
    },

    #[error("Store error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait FundingStore: Send + Sync + Debug {
    /// Insert a new `pending` request.
    async fn create(&self, request: NewFundingRequest) -> StoreResult<FundingRequest>;

    async fn get(&self, id: u64) -> StoreResult<Option<FundingRequest>>;

    /// Oldest `pending` request for the wallet and currency.
    async fn find_pending_by_wallet(
        &self,
        wallet: &str,
        currency: Currency,
    ) -> StoreResult<Option<FundingRequest>>;

    /// The request owning `hash`, in any status.
    async fn find_by_hash(&self, hash: &str) -> StoreResult<Option<FundingRequest>>;

    /// Record a newer confirmation count for the hash the request holds.
    ///
    /// Returns false when the request is terminal, holds another hash, or the
    /// hash belongs to another request. Counts never decrease.
    async fn attach_observation(
        &self,
        id: u64,
        hash: &str,
        confirmations: u64,
    ) -> StoreResult<bool>;

    /// Status compare-and-swap. `reason` is stored when moving to `failed`.
    ///
    /// Returns `Ok(false)` when the current status is not `from`. Transitions
    /// outside the lifecycle, and `confirmed -> settled` (see
    /// [`FundingStore::settle`]), are rejected with `IllegalTransition`.
    async fn transition(
        &self,
        id: u64,
        from: FundingStatus,
        to: FundingStatus,
        reason: Option<&str>,
    ) -> StoreResult<bool>;

    /// `pending -> chain_observed` CAS that also claims the chain hash and
    /// records the validated amount.
    async fn observe(&self, id: u64, observation: Observation) -> StoreResult<ObserveOutcome>;

    /// `confirmed -> settled` CAS, ledger credit of `actual_usd` and yield
    /// tier recompute, all or nothing.
    async fn settle(&self, id: u64, tiers: &YieldTierTable) -> StoreResult<SettleOutcome>;

    async fn is_hash_settled(&self, hash: &str) -> StoreResult<bool> {
        Ok(self
            .find_by_hash(hash)
            .await?
            .is_some_and(|request| request.status == FundingStatus::Settled))
    }

    /// Requests in `pending`, `chain_observed` or `confirmed`, oldest first.
    async fn list_in_flight(&self) -> StoreResult<Vec<FundingRequest>>;

    async fn count_by_status(&self, status: FundingStatus) -> StoreResult<u64>;

    async fn ledger(&self, user_id: u64) -> StoreResult<Option<UserLedger>>;
}

pub(crate) fn check_transition(from: FundingStatus, to: FundingStatus) -> StoreResult<()> {
    if to == FundingStatus::Settled || !from.can_transition_to(to) {
        return Err(StoreError::IllegalTransition { from, to });
    }
    Ok(())
}

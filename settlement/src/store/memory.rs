// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-local ledger with one mutex per request and per ledger row.
//!
//! Map locks are only held for lookups and inserts. Lock order is always
//! request, then hash owners or ledger row.

use super::{check_transition, FundingStore, StoreError, StoreResult};
use crate::funding::{
    Currency, FundingRequest, FundingStatus, NewFundingRequest, Observation, ObserveOutcome,
    SettleOutcome, Settlement, UserLedger,
};
use crate::utils::{normalize_address, now_ms};
use crate::yield_tier::YieldTierTable;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type RequestCell = Arc<Mutex<FundingRequest>>;

#[derive(Debug)]
pub struct InMemoryFundingStore {
    next_id: AtomicU64,
    requests: RwLock<BTreeMap<u64, RequestCell>>,
    hash_owners: RwLock<HashMap<String, u64>>,
    ledgers: RwLock<HashMap<u64, Arc<Mutex<UserLedger>>>>,
}

impl Default for InMemoryFundingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFundingStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            requests: RwLock::new(BTreeMap::new()),
            hash_owners: RwLock::new(HashMap::new()),
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    async fn cell(&self, id: u64) -> StoreResult<RequestCell> {
        self.requests
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn snapshot(&self) -> Vec<FundingRequest> {
        let cells: Vec<RequestCell> = self.requests.read().await.values().cloned().collect();
        let mut requests = Vec::with_capacity(cells.len());
        for cell in cells {
            requests.push(cell.lock().await.clone());
        }
        requests
    }

    async fn ledger_cell(&self, user_id: u64) -> Arc<Mutex<UserLedger>> {
        if let Some(cell) = self.ledgers.read().await.get(&user_id) {
            return cell.clone();
        }
        self.ledgers
            .write()
            .await
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(UserLedger::empty(user_id))))
            .clone()
    }

    /// Claim `hash` for `id`. Returns the current owner if it is another request.
    async fn claim_hash(&self, hash: &str, id: u64) -> Option<u64> {
        let mut owners = self.hash_owners.write().await;
        match owners.get(hash) {
            Some(&owner) if owner != id => Some(owner),
            _ => {
                owners.insert(hash.to_string(), id);
                None
            }
        }
    }
}

#[async_trait]
impl FundingStore for InMemoryFundingStore {
    async fn create(&self, request: NewFundingRequest) -> StoreResult<FundingRequest> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = request.into_request(id);
        self.requests
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(request.clone())));
        Ok(request)
    }

    async fn get(&self, id: u64) -> StoreResult<Option<FundingRequest>> {
        match self.cell(id).await {
            Ok(cell) => Ok(Some(cell.lock().await.clone())),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn find_pending_by_wallet(
        &self,
        wallet: &str,
        currency: Currency,
    ) -> StoreResult<Option<FundingRequest>> {
        let wallet = normalize_address(wallet);
        Ok(self
            .snapshot()
            .await
            .into_iter()
            .filter(|r| {
                r.status == FundingStatus::Pending
                    && r.currency == currency
                    && r.wallet_address == wallet
            })
            .min_by_key(|r| (r.created_at_ms, r.id)))
    }

    async fn find_by_hash(&self, hash: &str) -> StoreResult<Option<FundingRequest>> {
        let owner = self.hash_owners.read().await.get(hash).copied();
        match owner {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    async fn attach_observation(
        &self,
        id: u64,
        hash: &str,
        confirmations: u64,
    ) -> StoreResult<bool> {
        let cell = self.cell(id).await?;
        let mut request = cell.lock().await;
        if request.status.is_terminal() {
            return Ok(false);
        }
        match request.observed_chain_hash.as_deref() {
            Some(held) if held == hash => {}
            Some(_) => return Ok(false),
            None => {
                if self.claim_hash(hash, id).await.is_some() {
                    return Ok(false);
                }
                request.observed_chain_hash = Some(hash.to_string());
            }
        }
        if confirmations > request.observed_confirmations {
            request.observed_confirmations = confirmations;
            request.updated_at_ms = now_ms();
        }
        Ok(true)
    }

    async fn transition(
        &self,
        id: u64,
        from: FundingStatus,
        to: FundingStatus,
        reason: Option<&str>,
    ) -> StoreResult<bool> {
        check_transition(from, to)?;
        let cell = self.cell(id).await?;
        let mut request = cell.lock().await;
        if request.status != from {
            return Ok(false);
        }
        request.status = to;
        if to == FundingStatus::Failed {
            request.failure_reason = reason.map(str::to_string);
        }
        request.updated_at_ms = now_ms();
        Ok(true)
    }

    async fn observe(&self, id: u64, observation: Observation) -> StoreResult<ObserveOutcome> {
        let cell = self.cell(id).await?;
        let mut request = cell.lock().await;
        if request.status != FundingStatus::Pending {
            return Ok(ObserveOutcome::StatusMismatch(request.status));
        }
        // a pending request may already be bound to a hash through attach_observation
        if request
            .observed_chain_hash
            .as_deref()
            .is_some_and(|held| held != observation.chain_hash)
        {
            return Ok(ObserveOutcome::StatusMismatch(request.status));
        }
        if let Some(owner) = self.claim_hash(&observation.chain_hash, id).await {
            return Ok(ObserveOutcome::HashTaken(owner));
        }

        request.observed_chain_hash = Some(observation.chain_hash);
        request.observed_confirmations = request
            .observed_confirmations
            .max(observation.confirmations);
        request.observed_block_number = observation.block_number;
        request.actual_usd = Some(observation.actual_usd);
        request.status = FundingStatus::ChainObserved;
        request.updated_at_ms = now_ms();
        Ok(ObserveOutcome::Observed(request.clone()))
    }

    async fn settle(&self, id: u64, tiers: &YieldTierTable) -> StoreResult<SettleOutcome> {
        let cell = self.cell(id).await?;
        let mut request = cell.lock().await;
        if request.status != FundingStatus::Confirmed {
            return Ok(SettleOutcome::NotSettled(request.status));
        }
        let credited_usd = request.actual_usd.ok_or_else(|| {
            StoreError::Corrupt(format!("confirmed request {} has no actual amount", id))
        })?;

        let ledger_cell = self.ledger_cell(request.user_id).await;
        let mut ledger = ledger_cell.lock().await;
        let total_invested = ledger.total_invested + credited_usd;
        let current_balance = ledger.current_balance + credited_usd;

        // both writes happen under the request lock, after every fallible step
        ledger.total_invested = total_invested;
        ledger.current_balance = current_balance;
        ledger.daily_yield_rate = tiers.rate_for(total_invested);
        request.status = FundingStatus::Settled;
        request.updated_at_ms = now_ms();

        Ok(SettleOutcome::Settled(Settlement {
            request_id: id,
            user_id: request.user_id,
            currency: request.currency,
            chain_hash: request.observed_chain_hash.clone(),
            credited_usd,
            ledger: ledger.clone(),
        }))
    }

    async fn list_in_flight(&self) -> StoreResult<Vec<FundingRequest>> {
        let mut requests: Vec<FundingRequest> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|r| r.status.is_in_flight())
            .collect();
        requests.sort_by_key(|r| (r.created_at_ms, r.id));
        Ok(requests)
    }

    async fn count_by_status(&self, status: FundingStatus) -> StoreResult<u64> {
        Ok(self
            .snapshot()
            .await
            .iter()
            .filter(|r| r.status == status)
            .count() as u64)
    }

    async fn ledger(&self, user_id: u64) -> StoreResult<Option<UserLedger>> {
        let cell = self.ledgers.read().await.get(&user_id).cloned();
        match cell {
            Some(cell) => Ok(Some(cell.lock().await.clone())),
            None => Ok(None),
        }
    }
}

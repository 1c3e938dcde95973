// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Drives funding requests through their lifecycle.
//!
//! ```text
//! pending -> chain_observed -> confirmed -> settled
//!    \              \
//!     +---> failed <-+
//! ```
//!
//! All mutation goes through the store's CAS primitives, so any number of
//! webhook handlers and reaper ticks may call in concurrently. A caller that
//! loses a race gets [`StepOutcome::Lost`] and must not retry blindly.

use crate::error::{SettlementError, SettlementResult};
use crate::funding::{
    ChainEvent, FundingRequest, FundingStatus, Observation, ObserveOutcome, SettleOutcome,
    Settlement,
};
use crate::metrics::SettlementMetrics;
use crate::store::FundingStore;
use crate::yield_tier::YieldTierTable;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{info, warn};

pub const CANCELLED_REASON: &str = "cancelled";

/// Told about every committed settlement. Failures are logged and never
/// undo the settlement.
#[async_trait]
pub trait SettlementNotifier: Send + Sync + Debug {
    async fn notify(&self, settlement: &Settlement) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl SettlementNotifier for LogNotifier {
    async fn notify(&self, settlement: &Settlement) -> anyhow::Result<()> {
        info!(
            request_id = settlement.request_id,
            user_id = settlement.user_id,
            currency = %settlement.currency,
            credited_usd = %settlement.credited_usd,
            total_invested = %settlement.ledger.total_invested,
            daily_yield_rate = %settlement.ledger.daily_yield_rate,
            "Funding confirmed"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The request now sits in this status
    Advanced(FundingStatus),
    /// The request was already terminal; nothing changed
    AlreadyResolved(FundingStatus),
    /// The chain hash belongs to another request
    HashTaken(u64),
    /// A concurrent caller moved the request first
    Lost(FundingStatus),
}

#[derive(Debug)]
pub struct SettlementStateMachine {
    store: Arc<dyn FundingStore>,
    tiers: Arc<YieldTierTable>,
    notifier: Arc<dyn SettlementNotifier>,
    metrics: Arc<SettlementMetrics>,
}

impl SettlementStateMachine {
    pub fn new(
        store: Arc<dyn FundingStore>,
        tiers: Arc<YieldTierTable>,
        notifier: Arc<dyn SettlementNotifier>,
        metrics: Arc<SettlementMetrics>,
    ) -> Self {
        Self {
            store,
            tiers,
            notifier,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn FundingStore> {
        &self.store
    }

    /// Record an accepted transfer on its pending request, then advance as
    /// far as the confirmation depth allows.
    pub async fn on_accepted(
        &self,
        request: &FundingRequest,
        event: &ChainEvent,
        actual_usd: Decimal,
    ) -> SettlementResult<StepOutcome> {
        let observation = Observation {
            chain_hash: event.transaction_hash.clone(),
            confirmations: event.confirmations,
            block_number: event.block_number,
            actual_usd,
        };
        match self.store.observe(request.id, observation).await? {
            ObserveOutcome::Observed(observed) => {
                self.record_transition(FundingStatus::ChainObserved);
                info!(
                    "[StateMachine] Request {} observed {} (${}, {}/{} confirmations)",
                    observed.id,
                    event.transaction_hash,
                    actual_usd,
                    observed.observed_confirmations,
                    observed.required_confirmations
                );
                self.advance(request.id).await
            }
            ObserveOutcome::StatusMismatch(status) => {
                self.record_conflict("observe");
                if status.is_terminal() {
                    Ok(StepOutcome::AlreadyResolved(status))
                } else {
                    Ok(StepOutcome::Lost(status))
                }
            }
            ObserveOutcome::HashTaken(owner) => {
                self.record_conflict("observe");
                Ok(StepOutcome::HashTaken(owner))
            }
        }
    }

    /// Feed a newer confirmation depth for the hash the request holds.
    pub async fn record_confirmations(
        &self,
        id: u64,
        hash: &str,
        confirmations: u64,
    ) -> SettlementResult<StepOutcome> {
        if self
            .store
            .attach_observation(id, hash, confirmations)
            .await?
        {
            return self.advance(id).await;
        }
        let status = self.load(id).await?.status;
        if status.is_terminal() {
            info!(
                "[StateMachine] Request {} already resolved ({}), ignoring {} confirmations",
                id, status, confirmations
            );
            Ok(StepOutcome::AlreadyResolved(status))
        } else {
            self.record_conflict("attach_observation");
            Ok(StepOutcome::Lost(status))
        }
    }

    /// Move a request forward while its state allows: `chain_observed` with
    /// enough confirmations becomes `confirmed`, and `confirmed` is settled.
    pub async fn advance(&self, id: u64) -> SettlementResult<StepOutcome> {
        loop {
            let request = self.load(id).await?;
            match request.status {
                FundingStatus::ChainObserved if request.has_enough_confirmations() => {
                    if self
                        .store
                        .transition(
                            id,
                            FundingStatus::ChainObserved,
                            FundingStatus::Confirmed,
                            None,
                        )
                        .await?
                    {
                        self.record_transition(FundingStatus::Confirmed);
                        info!(
                            "[StateMachine] Request {} confirmed at {} confirmations",
                            id, request.observed_confirmations
                        );
                    } else {
                        self.record_conflict("confirm");
                    }
                }
                FundingStatus::Confirmed => {
                    return match self.store.settle(id, &self.tiers).await? {
                        SettleOutcome::Settled(settlement) => {
                            self.on_settled(&settlement).await;
                            Ok(StepOutcome::Advanced(FundingStatus::Settled))
                        }
                        SettleOutcome::NotSettled(status) => {
                            self.record_conflict("settle");
                            Ok(StepOutcome::Lost(status))
                        }
                    };
                }
                status if status.is_terminal() => {
                    return Ok(StepOutcome::AlreadyResolved(status));
                }
                status => return Ok(StepOutcome::Advanced(status)),
            }
        }
    }

    /// CAS `from -> failed`. Returns false when the request had moved on.
    pub async fn fail(
        &self,
        id: u64,
        from: FundingStatus,
        reason: &str,
    ) -> SettlementResult<bool> {
        if self
            .store
            .transition(id, from, FundingStatus::Failed, Some(reason))
            .await?
        {
            self.record_transition(FundingStatus::Failed);
            warn!(
                "[StateMachine] Request {} failed from {}: {}",
                id, from, reason
            );
            Ok(true)
        } else {
            self.record_conflict("fail");
            Ok(false)
        }
    }

    /// Administrative cancel of a request that has not been confirmed yet.
    pub async fn cancel(&self, id: u64) -> SettlementResult<bool> {
        loop {
            let status = self.load(id).await?.status;
            if !matches!(
                status,
                FundingStatus::Pending | FundingStatus::ChainObserved
            ) {
                info!(
                    "[StateMachine] Request {} is {}, cannot cancel",
                    id, status
                );
                return Ok(false);
            }
            if self.fail(id, status, CANCELLED_REASON).await? {
                return Ok(true);
            }
        }
    }

    async fn load(&self, id: u64) -> SettlementResult<FundingRequest> {
        self.store
            .get(id)
            .await?
            .ok_or(SettlementError::RequestNotFound(id))
    }

    async fn on_settled(&self, settlement: &Settlement) {
        self.record_transition(FundingStatus::Settled);
        let currency = settlement.currency.to_string();
        self.metrics
            .settlements
            .with_label_values(&[&currency])
            .inc();
        if let Some(cents) = (settlement.credited_usd * Decimal::ONE_HUNDRED).to_u64() {
            self.metrics
                .settled_usd_cents
                .with_label_values(&[&currency])
                .inc_by(cents);
        }
        info!(
            "[StateMachine] Request {} settled: credited ${} to user {} (total ${}, rate {}%)",
            settlement.request_id,
            settlement.credited_usd,
            settlement.user_id,
            settlement.ledger.total_invested,
            settlement.ledger.daily_yield_rate
        );
        if let Err(e) = self.notifier.notify(settlement).await {
            warn!(
                "[StateMachine] Settlement notifier failed for request {}: {:?}",
                settlement.request_id, e
            );
        }
    }

    fn record_transition(&self, status: FundingStatus) {
        self.metrics
            .transitions
            .with_label_values(&[status.as_str()])
            .inc();
    }

    fn record_conflict(&self, operation: &str) {
        self.metrics
            .cas_conflicts
            .with_label_values(&[operation])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funding::Currency;
    use crate::store::InMemoryFundingStore;
    use crate::test_utils::{eth_request, transfer_event};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SettlementNotifier for CountingNotifier {
        async fn notify(&self, _settlement: &Settlement) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("mailer down");
            }
            Ok(())
        }
    }

    fn machine(
        notifier: Arc<CountingNotifier>,
    ) -> (Arc<InMemoryFundingStore>, SettlementStateMachine) {
        let store = Arc::new(InMemoryFundingStore::new());
        let machine = SettlementStateMachine::new(
            store.clone(),
            Arc::new(YieldTierTable::default()),
            notifier,
            Arc::new(SettlementMetrics::new_for_testing()),
        );
        (store, machine)
    }

    #[tokio::test]
    async fn test_lifecycle_through_confirmations() {
        let notifier = Arc::new(CountingNotifier::default());
        let (store, machine) = machine(notifier.clone());
        let request = store.create(eth_request(1, dec!(1000))).await.unwrap();
        let event = transfer_event(Currency::Eth, "0xfeed", "400000000000000000", 3);

        let outcome = machine
            .on_accepted(&request, &event, dec!(1000))
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Advanced(FundingStatus::ChainObserved));

        let outcome = machine
            .record_confirmations(request.id, "0xfeed", 11)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Advanced(FundingStatus::ChainObserved));

        let outcome = machine
            .record_confirmations(request.id, "0xfeed", 12)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Advanced(FundingStatus::Settled));
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        let ledger = store.ledger(1).await.unwrap().unwrap();
        assert_eq!(ledger.total_invested, dec!(1000));
        assert_eq!(ledger.current_balance, dec!(1000));
        assert_eq!(ledger.daily_yield_rate, dec!(2.5));
    }

    #[tokio::test]
    async fn test_deep_observation_settles_immediately() {
        let (store, machine) = machine(Arc::new(CountingNotifier::default()));
        let request = store.create(eth_request(1, dec!(400))).await.unwrap();
        let event = transfer_event(Currency::Eth, "0xdeep", "1", 30);

        let outcome = machine
            .on_accepted(&request, &event, dec!(400))
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Advanced(FundingStatus::Settled));
        assert_eq!(
            store.ledger(1).await.unwrap().unwrap().daily_yield_rate,
            dec!(1.5)
        );
    }

    #[tokio::test]
    async fn test_terminal_requests_are_stable() {
        let (store, machine) = machine(Arc::new(CountingNotifier::default()));
        let request = store.create(eth_request(1, dec!(1000))).await.unwrap();
        let event = transfer_event(Currency::Eth, "0xdone", "1", 12);
        machine
            .on_accepted(&request, &event, dec!(1000))
            .await
            .unwrap();
        let settled = store.get(request.id).await.unwrap().unwrap();

        assert_eq!(
            machine.on_accepted(&request, &event, dec!(1000)).await.unwrap(),
            StepOutcome::AlreadyResolved(FundingStatus::Settled)
        );
        assert_eq!(
            machine
                .record_confirmations(request.id, "0xdone", 100)
                .await
                .unwrap(),
            StepOutcome::AlreadyResolved(FundingStatus::Settled)
        );
        assert!(!machine.cancel(request.id).await.unwrap());
        assert!(!machine
            .fail(request.id, FundingStatus::ChainObserved, "late")
            .await
            .unwrap());
        assert_eq!(
            machine.advance(request.id).await.unwrap(),
            StepOutcome::AlreadyResolved(FundingStatus::Settled)
        );

        assert_eq!(store.get(request.id).await.unwrap().unwrap(), settled);
        assert_eq!(
            store.ledger(1).await.unwrap().unwrap().total_invested,
            dec!(1000)
        );
    }

    #[tokio::test]
    async fn test_cancel() {
        let (store, machine) = machine(Arc::new(CountingNotifier::default()));
        let pending = store.create(eth_request(1, dec!(100))).await.unwrap();
        assert!(machine.cancel(pending.id).await.unwrap());
        let cancelled = store.get(pending.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, FundingStatus::Failed);
        assert_eq!(cancelled.failure_reason.as_deref(), Some(CANCELLED_REASON));

        let observed = store.create(eth_request(2, dec!(100))).await.unwrap();
        let event = transfer_event(Currency::Eth, "0xcancel", "1", 1);
        machine
            .on_accepted(&observed, &event, dec!(100))
            .await
            .unwrap();
        assert!(machine.cancel(observed.id).await.unwrap());

        assert!(matches!(
            machine.cancel(404).await,
            Err(SettlementError::RequestNotFound(404))
        ));
    }

    #[tokio::test]
    async fn test_notifier_failure_keeps_settlement() {
        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let (store, machine) = machine(notifier.clone());
        let request = store.create(eth_request(1, dec!(500))).await.unwrap();
        let event = transfer_event(Currency::Eth, "0xnotify", "1", 12);

        let outcome = machine
            .on_accepted(&request, &event, dec!(500))
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Advanced(FundingStatus::Settled));
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get(request.id).await.unwrap().unwrap().status,
            FundingStatus::Settled
        );
    }

    #[tokio::test]
    async fn test_hash_taken_by_other_request() {
        let (store, machine) = machine(Arc::new(CountingNotifier::default()));
        let first = store.create(eth_request(1, dec!(100))).await.unwrap();
        let second = store.create(eth_request(2, dec!(100))).await.unwrap();
        let event = transfer_event(Currency::Eth, "0xshared", "1", 1);

        machine.on_accepted(&first, &event, dec!(100)).await.unwrap();
        assert_eq!(
            machine
                .on_accepted(&second, &event, dec!(100))
                .await
                .unwrap(),
            StepOutcome::HashTaken(first.id)
        );
    }
}

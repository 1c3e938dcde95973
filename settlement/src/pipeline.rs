// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Gateway -> validator -> state machine.
//!
//! An event whose hash is already attached to a request only ever updates
//! that request's confirmation depth. Any other event is matched against the
//! oldest pending request for its wallet and currency and judged by the
//! validator. Price-deferred events and events that hit a transient error
//! wait in the retry queue for the next reaper tick.

use crate::error::SettlementResult;
use crate::funding::{ChainEvent, FundingStatus};
use crate::gateway::{EventGateway, IngestReport};
use crate::metrics::SettlementMetrics;
use crate::state_machine::{SettlementStateMachine, StepOutcome};
use crate::store::FundingStore;
use crate::ttl_cache::CacheStats;
use crate::utils::now_ms;
use crate::validator::{RejectReason, TransactionValidator, Verdict};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Attempts at matching one event when candidates keep moving under it.
const MAX_MATCH_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Advanced {
        request_id: u64,
        status: FundingStatus,
    },
    AlreadyResolved {
        request_id: u64,
        status: FundingStatus,
    },
    Rejected {
        request_id: Option<u64>,
        reason: RejectReason,
        failed_request: bool,
    },
    /// Parked until a trustworthy price is available
    Deferred { request_id: u64 },
    /// Every attempt lost a race; the next delivery or reaper tick retries
    Lost { request_id: u64, status: FundingStatus },
}

/// An event waiting for the next reaper tick
#[derive(Debug, Clone)]
struct Parked {
    event: ChainEvent,
    /// Set when the event was fabricated for one request
    request_id: Option<u64>,
}

#[derive(Debug)]
pub struct DepositPipeline {
    gateway: Arc<EventGateway>,
    validator: TransactionValidator,
    machine: Arc<SettlementStateMachine>,
    store: Arc<dyn FundingStore>,
    retry_queue: Mutex<HashMap<String, Parked>>,
    retry_window: Duration,
    metrics: Arc<SettlementMetrics>,
}

impl DepositPipeline {
    pub fn new(
        gateway: Arc<EventGateway>,
        validator: TransactionValidator,
        machine: Arc<SettlementStateMachine>,
        store: Arc<dyn FundingStore>,
        retry_window: Duration,
        metrics: Arc<SettlementMetrics>,
    ) -> Self {
        Self {
            gateway,
            validator,
            machine,
            store,
            retry_queue: Mutex::new(HashMap::new()),
            retry_window,
            metrics,
        }
    }

    pub fn gateway(&self) -> &Arc<EventGateway> {
        &self.gateway
    }

    pub fn state_machine(&self) -> &Arc<SettlementStateMachine> {
        &self.machine
    }

    /// Normalize a payload and process every forwarded event. Processing
    /// errors are logged; the caller only learns what was ingested.
    pub async fn handle_payload(&self, payload: &Value) -> IngestReport {
        let ingested = self.gateway.ingest(payload).await;
        for event in ingested.events {
            if let Err(e) = self.process_event(event.clone()).await {
                if e.is_transient() {
                    // parked already; a redelivery may also go through
                    self.gateway.forget(&event).await;
                    warn!("[Pipeline] {} parked for retry: {:?}", event, e);
                } else {
                    error!("[Pipeline] Failed to process {}: {:?}", event, e);
                }
            }
        }
        ingested.report
    }

    /// Match `event` to its owner or to the oldest pending request on its
    /// wallet, then judge it.
    pub async fn process_event(&self, event: ChainEvent) -> SettlementResult<ProcessOutcome> {
        self.process(event, None).await
    }

    /// Judge `event` against `request_id` only. Transfers fabricated for one
    /// request never land on another request sharing its wallet.
    pub async fn process_for_request(
        &self,
        request_id: u64,
        event: ChainEvent,
    ) -> SettlementResult<ProcessOutcome> {
        self.process(event, Some(request_id)).await
    }

    async fn process(
        &self,
        event: ChainEvent,
        request_id: Option<u64>,
    ) -> SettlementResult<ProcessOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.try_process(&event, request_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if e.is_transient() {
                        self.park(&event, request_id).await;
                    }
                    return Err(e);
                }
            };
            match outcome {
                ProcessOutcome::Lost { .. } if attempt < MAX_MATCH_ATTEMPTS => continue,
                ProcessOutcome::Deferred { .. } => self.park(&event, request_id).await,
                _ => {
                    self.retry_queue.lock().await.remove(&event.transaction_hash);
                }
            }
            return Ok(outcome);
        }
    }

    async fn park(&self, event: &ChainEvent, request_id: Option<u64>) {
        self.retry_queue.lock().await.insert(
            event.transaction_hash.clone(),
            Parked {
                event: event.clone(),
                request_id,
            },
        );
    }

    async fn try_process(
        &self,
        event: &ChainEvent,
        request_id: Option<u64>,
    ) -> SettlementResult<ProcessOutcome> {
        if let Some(owner) = self.store.find_by_hash(&event.transaction_hash).await? {
            if owner.status.is_terminal() {
                info!(
                    "[Pipeline] {} already resolved as {} on request {}",
                    event.transaction_hash, owner.status, owner.id
                );
                return Ok(ProcessOutcome::AlreadyResolved {
                    request_id: owner.id,
                    status: owner.status,
                });
            }
            let step = self
                .machine
                .record_confirmations(owner.id, &event.transaction_hash, event.confirmations)
                .await?;
            return Ok(Self::from_step(owner.id, step));
        }

        let candidate = match request_id {
            Some(id) => self
                .store
                .get(id)
                .await?
                .filter(|request| request.status == FundingStatus::Pending),
            None => {
                self.store
                    .find_pending_by_wallet(&event.to_address, event.symbol)
                    .await?
            }
        };
        let verdict = self.validator.validate(event, candidate.as_ref()).await?;
        self.metrics
            .verdicts
            .with_label_values(&[verdict.label()])
            .inc();

        let Some(request) = candidate else {
            if let Verdict::Rejected { reason, .. } = verdict {
                info!("[Pipeline] Discarding {}: {}", event, reason);
                return Ok(ProcessOutcome::Rejected {
                    request_id: None,
                    reason,
                    failed_request: false,
                });
            }
            // the validator rejects every event without a candidate
            return Ok(ProcessOutcome::Rejected {
                request_id: None,
                reason: RejectReason::NoMatchingRequest,
                failed_request: false,
            });
        };

        match verdict {
            Verdict::Accepted { actual_usd } => {
                let step = self.machine.on_accepted(&request, event, actual_usd).await?;
                match step {
                    StepOutcome::HashTaken(owner) => {
                        let step = self
                            .machine
                            .record_confirmations(
                                owner,
                                &event.transaction_hash,
                                event.confirmations,
                            )
                            .await?;
                        Ok(Self::from_step(owner, step))
                    }
                    step => Ok(Self::from_step(request.id, step)),
                }
            }
            Verdict::Rejected { reason, actual_usd } => {
                let failed_request = if reason.fails_request() {
                    warn!(
                        "[Pipeline] Rejecting request {} on {} (${}): {}",
                        request.id,
                        event.transaction_hash,
                        actual_usd.unwrap_or_default(),
                        reason
                    );
                    self.machine
                        .fail(request.id, FundingStatus::Pending, &reason.to_string())
                        .await?
                } else {
                    info!("[Pipeline] Discarding {}: {}", event, reason);
                    false
                };
                Ok(ProcessOutcome::Rejected {
                    request_id: Some(request.id),
                    reason,
                    failed_request,
                })
            }
            Verdict::Deferred { reason } => {
                warn!(
                    "[Pipeline] Deferring {} for request {}: {}",
                    event.transaction_hash, request.id, reason
                );
                Ok(ProcessOutcome::Deferred {
                    request_id: request.id,
                })
            }
        }
    }

    fn from_step(request_id: u64, step: StepOutcome) -> ProcessOutcome {
        match step {
            StepOutcome::Advanced(status) => ProcessOutcome::Advanced { request_id, status },
            StepOutcome::AlreadyResolved(status) => {
                ProcessOutcome::AlreadyResolved { request_id, status }
            }
            StepOutcome::Lost(status) => ProcessOutcome::Lost { request_id, status },
            // raised only by `on_accepted`, which the caller handles
            StepOutcome::HashTaken(owner) => ProcessOutcome::Lost {
                request_id: owner,
                status: FundingStatus::ChainObserved,
            },
        }
    }

    /// Re-run parked events. Events older than the retry window are dropped;
    /// events that still cannot be judged park again.
    pub async fn retry_parked(&self) -> Vec<ProcessOutcome> {
        let parked: Vec<Parked> = self
            .retry_queue
            .lock()
            .await
            .drain()
            .map(|(_, parked)| parked)
            .collect();
        let now = now_ms();
        let window_ms = self.retry_window.as_millis() as u64;
        let mut outcomes = Vec::with_capacity(parked.len());
        for Parked { event, request_id } in parked {
            if now.saturating_sub(event.observed_at_ms) > window_ms {
                warn!("[Pipeline] Dropping parked {}: window exceeded", event);
                continue;
            }
            match self.process(event.clone(), request_id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("[Pipeline] Retry of parked {} failed: {:?}", event, e),
            }
        }
        outcomes
    }

    pub async fn parked_count(&self) -> usize {
        self.retry_queue.lock().await.len()
    }

    pub fn price_cache_stats(&self) -> CacheStats {
        self.validator.oracle().cache_stats()
    }
}

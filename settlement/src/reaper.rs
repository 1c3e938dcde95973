// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Periodic sweep over in-flight funding requests.
//!
//! Each tick expires requests that outlived the observation window, asks the
//! confirmation source for fabricated transfers and fresh depths, retries
//! settlement of `confirmed` requests and re-runs parked events.
//! Requests are handled concurrently and one failure never aborts the tick.

use crate::confirmation::ConfirmationSource;
use crate::error::{SettlementError, SettlementResult};
use crate::funding::{FundingRequest, FundingStatus};
use crate::metrics::SettlementMetrics;
use crate::pipeline::{DepositPipeline, ProcessOutcome};
use crate::state_machine::StepOutcome;
use crate::utils::now_ms;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const WINDOW_EXCEEDED_REASON: &str = "observation window exceeded";

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub inspected: usize,
    pub expired: usize,
    pub observed: usize,
    pub confirmations_updated: usize,
    pub settled: usize,
    pub parked_retried: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Idle,
    Expired,
    Observed,
    ConfirmationsUpdated,
    Settled,
}

#[derive(Debug)]
pub struct Reaper {
    pipeline: Arc<DepositPipeline>,
    source: Arc<dyn ConfirmationSource>,
    max_observation_window: Duration,
    interval: Duration,
    metrics: Arc<SettlementMetrics>,
}

impl Reaper {
    pub fn new(
        pipeline: Arc<DepositPipeline>,
        source: Arc<dyn ConfirmationSource>,
        max_observation_window: Duration,
        interval: Duration,
        metrics: Arc<SettlementMetrics>,
    ) -> Self {
        Self {
            pipeline,
            source,
            max_observation_window,
            interval,
            metrics,
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(&self, cancel: CancellationToken) {
        info!(
            "[Reaper] Starting ({} feed, interval={:?}, window={:?})",
            self.source.mode().as_str(),
            self.interval,
            self.max_observation_window
        );
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[Reaper] Cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report != TickReport::default() {
                        debug!("[Reaper] Tick: {:?}", report);
                    }
                }
            }
        }
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(now_ms()).await
    }

    /// One sweep with `now_ms` as the current time.
    pub async fn tick_at(&self, now_ms: u64) -> TickReport {
        let started = Instant::now();
        self.metrics.reaper_ticks.inc();
        let mut report = TickReport::default();

        match self.pipeline.state_machine().store().list_in_flight().await {
            Ok(requests) => {
                self.update_gauges(&requests);
                report.inspected = requests.len();
                let results =
                    join_all(requests.iter().map(|request| self.reap(request, now_ms))).await;
                for (request, result) in requests.iter().zip(results) {
                    match result {
                        Ok(Action::Idle) => {}
                        Ok(Action::Expired) => report.expired += 1,
                        Ok(Action::Observed) => report.observed += 1,
                        Ok(Action::ConfirmationsUpdated) => report.confirmations_updated += 1,
                        Ok(Action::Settled) => report.settled += 1,
                        Err(e) => {
                            report.errors += 1;
                            self.record_error(&e);
                            if e.is_transient() {
                                warn!("[Reaper] Request {} will be retried: {:?}", request.id, e);
                            } else {
                                error!("[Reaper] Request {} failed: {:?}", request.id, e);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                let e = SettlementError::from(e);
                report.errors += 1;
                self.record_error(&e);
                error!("[Reaper] Failed to list in-flight requests: {:?}", e);
            }
        }

        report.parked_retried = self.pipeline.retry_parked().await.len();
        self.metrics
            .reaper_tick_latency
            .observe(started.elapsed().as_secs_f64());
        report
    }

    async fn reap(&self, request: &FundingRequest, now_ms: u64) -> SettlementResult<Action> {
        let machine = self.pipeline.state_machine();
        let expirable = matches!(
            request.status,
            FundingStatus::Pending | FundingStatus::ChainObserved
        );
        if expirable && request.age_ms(now_ms) > self.max_observation_window.as_millis() as u64 {
            let expired = machine
                .fail(request.id, request.status, WINDOW_EXCEEDED_REASON)
                .await?;
            if expired {
                info!(
                    "[Reaper] Request {} expired after {}s in {}",
                    request.id,
                    request.age_ms(now_ms) / 1000,
                    request.status
                );
                return Ok(Action::Expired);
            }
            return Ok(Action::Idle);
        }

        match request.status {
            FundingStatus::Pending => {
                let Some(event) = self.source.synthesize_observation(request, now_ms).await? else {
                    return Ok(Action::Idle);
                };
                let outcome = self.pipeline.process_for_request(request.id, event).await?;
                debug!("[Reaper] Simulated transfer for request {}: {:?}", request.id, outcome);
                Ok(match outcome {
                    ProcessOutcome::Advanced {
                        status: FundingStatus::Settled,
                        ..
                    } => Action::Settled,
                    ProcessOutcome::Advanced { .. } => Action::Observed,
                    _ => Action::Idle,
                })
            }
            FundingStatus::ChainObserved => {
                let (Some(hash), Some(depth)) = (
                    request.observed_chain_hash.as_deref(),
                    self.source.current_confirmations(request, now_ms).await?,
                ) else {
                    return Ok(Action::Idle);
                };
                if depth <= request.observed_confirmations {
                    return Ok(Action::Idle);
                }
                Ok(
                    match machine.record_confirmations(request.id, hash, depth).await? {
                        StepOutcome::Advanced(FundingStatus::Settled) => Action::Settled,
                        StepOutcome::Advanced(_) => Action::ConfirmationsUpdated,
                        _ => Action::Idle,
                    },
                )
            }
            FundingStatus::Confirmed => {
                warn!(
                    "[Reaper] Request {} confirmed but not settled, retrying settlement",
                    request.id
                );
                Ok(match machine.advance(request.id).await? {
                    StepOutcome::Advanced(FundingStatus::Settled) => Action::Settled,
                    _ => Action::Idle,
                })
            }
            FundingStatus::Settled | FundingStatus::Failed => Ok(Action::Idle),
        }
    }

    fn update_gauges(&self, requests: &[FundingRequest]) {
        let mut counts: HashMap<FundingStatus, i64> = HashMap::new();
        for request in requests {
            *counts.entry(request.status).or_default() += 1;
        }
        for status in [
            FundingStatus::Pending,
            FundingStatus::ChainObserved,
            FundingStatus::Confirmed,
        ] {
            self.metrics
                .in_flight_requests
                .with_label_values(&[status.as_str()])
                .set(counts.get(&status).copied().unwrap_or_default());
        }
    }

    fn record_error(&self, e: &SettlementError) {
        self.metrics
            .reaper_errors
            .with_label_values(&[e.error_type()])
            .inc();
    }
}

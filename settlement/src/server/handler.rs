// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::confirmation::FeedMode;
use crate::error::{SettlementError, SettlementResult};
use crate::funding::{Currency, FundingRequest, FundingStatus};
use crate::gateway::IngestReport;
use crate::pipeline::DepositPipeline;
use crate::store::FundingStore;
use crate::ttl_cache::CacheStats;
use crate::utils::normalize_hash;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct NodeStatus {
    pub monitoring_mode: String,
    pub monitored_wallets: BTreeMap<Currency, Vec<String>>,
    pub pending_requests: u64,
    pub parked_events: usize,
    pub price_cache: CacheStats,
    pub price_cache_hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct TransactionStatus {
    pub transaction_hash: String,
    /// `pending` when no request holds the hash yet
    pub status: FundingStatus,
    pub request_id: Option<u64>,
    pub confirmations: u64,
    pub required_confirmations: Option<u64>,
}

#[async_trait]
pub trait SettlementRequestHandlerTrait {
    // Normalizes and processes a pushed chain event payload. Only a body that
    // is not JSON is an error; everything else is reported in the IngestReport.
    async fn handle_chain_event(&self, body: Bytes) -> Result<Json<IngestReport>, SettlementError>;

    async fn handle_status(&self) -> Result<Json<NodeStatus>, SettlementError>;

    async fn handle_get_request(&self, id: u64) -> Result<Json<FundingRequest>, SettlementError>;

    async fn handle_transaction_status(
        &self,
        hash: String,
    ) -> Result<Json<TransactionStatus>, SettlementError>;
}

pub struct SettlementRequestHandler {
    pipeline: Arc<DepositPipeline>,
    store: Arc<dyn FundingStore>,
    feed_mode: FeedMode,
}

impl SettlementRequestHandler {
    pub fn new(pipeline: Arc<DepositPipeline>, feed_mode: FeedMode) -> Self {
        let store = pipeline.state_machine().store().clone();
        Self {
            pipeline,
            store,
            feed_mode,
        }
    }
}

pub(crate) fn parse_payload(body: &[u8]) -> SettlementResult<Value> {
    serde_json::from_slice(body).map_err(|e| SettlementError::MalformedPayload(e.to_string()))
}

#[async_trait]
impl SettlementRequestHandlerTrait for SettlementRequestHandler {
    async fn handle_chain_event(&self, body: Bytes) -> Result<Json<IngestReport>, SettlementError> {
        let payload = parse_payload(&body).inspect_err(|e| {
            warn!("[Gateway] Rejecting webhook body of {} bytes: {}", body.len(), e);
        })?;
        let report = self.pipeline.handle_payload(&payload).await;
        Ok(Json(report))
    }

    async fn handle_status(&self) -> Result<Json<NodeStatus>, SettlementError> {
        let stats = self.pipeline.price_cache_stats();
        Ok(Json(NodeStatus {
            monitoring_mode: self.feed_mode.as_str().to_string(),
            monitored_wallets: self.pipeline.gateway().monitored_wallets(),
            pending_requests: self.store.count_by_status(FundingStatus::Pending).await?,
            parked_events: self.pipeline.parked_count().await,
            price_cache: stats,
            price_cache_hit_rate: stats.hit_rate(),
        }))
    }

    async fn handle_get_request(&self, id: u64) -> Result<Json<FundingRequest>, SettlementError> {
        self.store
            .get(id)
            .await?
            .map(Json)
            .ok_or(SettlementError::RequestNotFound(id))
    }

    async fn handle_transaction_status(
        &self,
        hash: String,
    ) -> Result<Json<TransactionStatus>, SettlementError> {
        let hash = normalize_hash(&hash);
        let owner = self.store.find_by_hash(&hash).await?;
        Ok(Json(match owner {
            Some(request) => TransactionStatus {
                transaction_hash: hash,
                status: request.status,
                request_id: Some(request.id),
                confirmations: request.observed_confirmations,
                required_confirmations: Some(request.required_confirmations),
            },
            None => TransactionStatus {
                transaction_hash: hash,
                status: FundingStatus::Pending,
                request_id: None,
                confirmations: 0,
                required_confirmations: None,
            },
        }))
    }
}

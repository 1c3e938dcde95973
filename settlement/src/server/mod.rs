// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::with_metrics;
use crate::{
    error::SettlementError,
    funding::FundingRequest,
    gateway::IngestReport,
    metrics::SettlementMetrics,
    server::handler::{
        NodeStatus, SettlementRequestHandler, SettlementRequestHandlerTrait, TransactionStatus,
    },
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

pub mod handler;

pub const HEALTH_PATH: &str = "/health";
pub const CHAIN_EVENTS_PATH: &str = "/events/chain";
pub const STATUS_PATH: &str = "/status";
pub const METRICS_PATH: &str = "/metrics";
// Note: Using :param syntax for axum 0.7.x (not {param} which is for axum 0.8.x)
pub const REQUEST_PATH: &str = "/requests/:id";
pub const TRANSACTION_STATUS_PATH: &str = "/transactions/:hash/status";

type ServerState<H> = (Arc<H>, Arc<SettlementMetrics>, Registry);

pub async fn run_server(
    socket_address: &SocketAddr,
    handler: SettlementRequestHandler,
    metrics: Arc<SettlementMetrics>,
    registry: Registry,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(socket_address).await?;
    info!("Settlement server listening on {}", listener.local_addr()?);
    Ok(serve(listener, Arc::new(handler), metrics, registry, cancel))
}

pub(crate) fn serve(
    listener: TcpListener,
    handler: Arc<impl SettlementRequestHandlerTrait + Sync + Send + 'static>,
    metrics: Arc<SettlementMetrics>,
    registry: Registry,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(
            listener,
            make_router(handler, metrics, registry).into_make_service(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await;
        if let Err(e) = result {
            error!("Settlement server stopped: {:?}", e);
        }
    })
}

pub(crate) fn make_router(
    handler: Arc<impl SettlementRequestHandlerTrait + Sync + Send + 'static>,
    metrics: Arc<SettlementMetrics>,
    registry: Registry,
) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(CHAIN_EVENTS_PATH, post(handle_chain_event))
        .route(STATUS_PATH, get(handle_status))
        .route(REQUEST_PATH, get(handle_get_request))
        .route(TRANSACTION_STATUS_PATH, get(handle_transaction_status))
        .route(METRICS_PATH, get(handle_metrics))
        .with_state((handler, metrics, registry))
}

impl IntoResponse for SettlementError {
    fn into_response(self) -> Response {
        let status = match &self {
            SettlementError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            SettlementError::RequestNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(serde_json::json!({
                "error": self.to_string(),
                "type": self.error_type(),
            })),
        )
            .into_response()
    }
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

#[instrument(level = "info", skip_all, fields(body_len = body.len()))]
async fn handle_chain_event<H: SettlementRequestHandlerTrait + Sync + Send>(
    State((handler, metrics, _)): State<ServerState<H>>,
    body: Bytes,
) -> Result<Json<IngestReport>, SettlementError> {
    let future = async { handler.handle_chain_event(body).await };
    with_metrics!(metrics.clone(), "handle_chain_event", future).await
}

#[instrument(level = "info", skip_all)]
async fn handle_status<H: SettlementRequestHandlerTrait + Sync + Send>(
    State((handler, metrics, _)): State<ServerState<H>>,
) -> Result<Json<NodeStatus>, SettlementError> {
    let future = async { handler.handle_status().await };
    with_metrics!(metrics.clone(), "handle_status", future).await
}

#[instrument(level = "info", skip_all, fields(request_id = id))]
async fn handle_get_request<H: SettlementRequestHandlerTrait + Sync + Send>(
    Path(id): Path<u64>,
    State((handler, metrics, _)): State<ServerState<H>>,
) -> Result<Json<FundingRequest>, SettlementError> {
    let future = async { handler.handle_get_request(id).await };
    with_metrics!(metrics.clone(), "handle_get_request", future).await
}

#[instrument(level = "info", skip_all, fields(tx_hash = hash))]
async fn handle_transaction_status<H: SettlementRequestHandlerTrait + Sync + Send>(
    Path(hash): Path<String>,
    State((handler, metrics, _)): State<ServerState<H>>,
) -> Result<Json<TransactionStatus>, SettlementError> {
    let future = async { handler.handle_transaction_status(hash).await };
    with_metrics!(metrics.clone(), "handle_transaction_status", future).await
}

async fn handle_metrics<H: SettlementRequestHandlerTrait + Sync + Send>(
    State((_, _, registry)): State<ServerState<H>>,
) -> Result<Response, SettlementError> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| SettlementError::Generic(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
        buffer,
    )
        .into_response())
}

#[macro_export]
macro_rules! with_metrics {
    ($metrics:expr, $type_:expr, $func:expr) => {
        async move {
            tracing::debug!("Received {} request", $type_);
            $metrics
                .requests_received
                .with_label_values(&[$type_])
                .inc();
            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .inc();

            let result = $func.await;

            match &result {
                Ok(_) => {
                    $metrics.requests_ok.with_label_values(&[$type_]).inc();
                }
                Err(e) => {
                    tracing::info!("{} request failed: {:?}", $type_, e);
                    $metrics.err_requests.with_label_values(&[$type_]).inc();
                }
            }

            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .dec();
            result
        }
    };
}

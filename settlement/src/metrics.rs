// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, Histogram,
    IntCounter, IntCounterVec, IntGaugeVec, Registry,
};

const TICK_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 20., 30., 60., 120.,
];

#[derive(Clone, Debug)]
pub struct SettlementMetrics {
    pub(crate) requests_received: IntCounterVec,
    pub(crate) requests_ok: IntCounterVec,
    pub(crate) err_requests: IntCounterVec,
    pub(crate) requests_inflight: IntGaugeVec,

    pub(crate) gateway_received_events: IntCounter,
    pub(crate) gateway_forwarded_events: IntCounter,
    pub(crate) gateway_discarded_events: IntCounterVec,

    pub(crate) verdicts: IntCounterVec,
    pub(crate) transitions: IntCounterVec,
    pub(crate) cas_conflicts: IntCounterVec,

    pub(crate) settlements: IntCounterVec,
    // Cents, so the counter stays integral
    pub(crate) settled_usd_cents: IntCounterVec,

    pub(crate) price_lookups: IntCounterVec,

    pub(crate) reaper_ticks: IntCounter,
    pub(crate) reaper_tick_latency: Histogram,
    pub(crate) reaper_errors: IntCounterVec,
    pub(crate) in_flight_requests: IntGaugeVec,
}

impl SettlementMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            requests_received: register_int_counter_vec_with_registry!(
                "settlement_requests_received",
                "Total number of requests received in Server, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_ok: register_int_counter_vec_with_registry!(
                "settlement_requests_ok",
                "Total number of ok requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            err_requests: register_int_counter_vec_with_registry!(
                "settlement_err_requests",
                "Total number of erred requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_inflight: register_int_gauge_vec_with_registry!(
                "settlement_requests_inflight",
                "Total number of inflight requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            gateway_received_events: register_int_counter_with_registry!(
                "settlement_gateway_received_events",
                "Total number of raw transfer entries received by the gateway",
                registry,
            )
            .unwrap(),
            gateway_forwarded_events: register_int_counter_with_registry!(
                "settlement_gateway_forwarded_events",
                "Total number of normalized events forwarded to the pipeline",
                registry,
            )
            .unwrap(),
            gateway_discarded_events: register_int_counter_vec_with_registry!(
                "settlement_gateway_discarded_events",
                "Total number of discarded transfer entries, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            verdicts: register_int_counter_vec_with_registry!(
                "settlement_verdicts",
                "Total number of validator verdicts, by outcome",
                &["outcome"],
                registry,
            )
            .unwrap(),
            transitions: register_int_counter_vec_with_registry!(
                "settlement_transitions",
                "Total number of committed status transitions, by target status",
                &["status"],
                registry,
            )
            .unwrap(),
            cas_conflicts: register_int_counter_vec_with_registry!(
                "settlement_cas_conflicts",
                "Total number of lost compare-and-swap races, by operation",
                &["operation"],
                registry,
            )
            .unwrap(),
            settlements: register_int_counter_vec_with_registry!(
                "settlement_settlements",
                "Total number of settled funding requests, by currency",
                &["currency"],
                registry,
            )
            .unwrap(),
            settled_usd_cents: register_int_counter_vec_with_registry!(
                "settlement_settled_usd_cents",
                "Total USD credited to ledgers in cents, by currency",
                &["currency"],
                registry,
            )
            .unwrap(),
            price_lookups: register_int_counter_vec_with_registry!(
                "settlement_price_lookups",
                "Total number of price lookups, by confidence",
                &["confidence"],
                registry,
            )
            .unwrap(),
            reaper_ticks: register_int_counter_with_registry!(
                "settlement_reaper_ticks",
                "Total number of completed reaper ticks",
                registry,
            )
            .unwrap(),
            reaper_tick_latency: register_histogram_with_registry!(
                "settlement_reaper_tick_latency",
                "Wall time of one reaper tick in seconds",
                TICK_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            reaper_errors: register_int_counter_vec_with_registry!(
                "settlement_reaper_errors",
                "Total number of failed reaper operations, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            in_flight_requests: register_int_gauge_vec_with_registry!(
                "settlement_in_flight_requests",
                "Number of non-terminal funding requests seen by the last reaper tick, by status",
                &["status"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn test_metrics_are_exported() {
        let registry = Registry::new();
        let metrics = SettlementMetrics::new(&registry);

        metrics.verdicts.with_label_values(&["accepted"]).inc();
        metrics
            .settled_usd_cents
            .with_label_values(&["ETH"])
            .inc_by(100_000);
        metrics.reaper_ticks.inc();

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("settlement_verdicts{outcome=\"accepted\"} 1"));
        assert!(text.contains("settlement_settled_usd_cents{currency=\"ETH\"} 100000"));
        assert!(text.contains("settlement_reaper_ticks 1"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let _metrics = SettlementMetrics::new(&registry);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            SettlementMetrics::new(&registry)
        }));
        assert!(result.is_err());
    }
}

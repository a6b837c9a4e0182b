//! Prometheus metrics
//!
//! One registry per engine instance, so tests can build several engines in
//! the same process.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::error::SwapError;
use crate::types::{ChainKind, SwapStatus};

pub struct Metrics {
    pub swaps_initiated_total: IntCounter,
    pub swaps_completed_total: IntCounter,
    pub swaps_refunded_total: IntCounter,
    pub swaps_failed_total: IntCounter,
    /// Status transitions, labelled by target status
    pub transitions_total: IntCounterVec,
    /// Chain call failures, labelled by chain family and error kind
    pub rpc_errors_total: IntCounterVec,
    pub fee_bumps_total: IntCounter,
    pub endpoint_failovers_total: IntCounter,
    pub active_watchers: IntGauge,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let swaps_initiated_total = IntCounter::new(
            "swap_resolver_swaps_initiated_total",
            "Total number of swap orders initiated",
        )
        .expect("constant metric name is valid");

        let swaps_completed_total = IntCounter::new(
            "swap_resolver_swaps_completed_total",
            "Total number of fills completed on both legs",
        )
        .expect("constant metric name is valid");

        let swaps_refunded_total = IntCounter::new(
            "swap_resolver_swaps_refunded_total",
            "Total number of fills refunded after timeout",
        )
        .expect("constant metric name is valid");

        let swaps_failed_total = IntCounter::new(
            "swap_resolver_swaps_failed_total",
            "Total number of fills that ended in failed",
        )
        .expect("constant metric name is valid");

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "swap_resolver_transitions_total",
                "Swap status transitions by target status",
            ),
            &["status"],
        )
        .expect("constant metric name is valid");

        let rpc_errors_total = IntCounterVec::new(
            Opts::new(
                "swap_resolver_rpc_errors_total",
                "Chain client errors by chain family and kind",
            ),
            &["chain", "kind"],
        )
        .expect("constant metric name is valid");

        let fee_bumps_total = IntCounter::new(
            "swap_resolver_fee_bumps_total",
            "Replacement transactions broadcast at a higher fee rate",
        )
        .expect("constant metric name is valid");

        let endpoint_failovers_total = IntCounter::new(
            "swap_resolver_endpoint_failovers_total",
            "Times a chain client switched to a backup endpoint",
        )
        .expect("constant metric name is valid");

        let active_watchers = IntGauge::new(
            "swap_resolver_active_watchers",
            "Orders currently monitored by a watcher task",
        )
        .expect("constant metric name is valid");

        registry
            .register(Box::new(swaps_initiated_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(swaps_completed_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(swaps_refunded_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(swaps_failed_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(transitions_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(rpc_errors_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(fee_bumps_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(endpoint_failovers_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(active_watchers.clone()))
            .expect("metric registration must not be called twice");

        Self {
            swaps_initiated_total,
            swaps_completed_total,
            swaps_refunded_total,
            swaps_failed_total,
            transitions_total,
            rpc_errors_total,
            fee_bumps_total,
            endpoint_failovers_total,
            active_watchers,
            registry,
        }
    }

    pub fn record_transition(&self, to: SwapStatus) {
        self.transitions_total
            .with_label_values(&[to.as_str()])
            .inc();
        match to {
            SwapStatus::Completed => self.swaps_completed_total.inc(),
            SwapStatus::Refunded => self.swaps_refunded_total.inc(),
            SwapStatus::Failed => self.swaps_failed_total.inc(),
            _ => {}
        }
    }

    pub fn record_rpc_error(&self, chain: ChainKind, error: &SwapError) {
        self.rpc_errors_total
            .with_label_values(&[chain.as_str(), error.kind()])
            .inc();
    }
}

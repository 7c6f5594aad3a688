//! Metrics collection for Expo
//!
//! This module provides Prometheus metrics for the dispatcher. Metrics are
//! process-local; [`MetricsRegistry::gather`] renders them on demand.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Expo
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub dispatcher: DispatcherMetrics,
}

/// Dispatcher metrics
#[derive(Debug, Clone)]
pub struct DispatcherMetrics {
    /// Workers that came on duty
    pub joins_total: IntCounter,

    /// Workers that went off duty
    pub leaves_total: IntCounter,

    /// Orders that were assigned a worker
    pub orders_routed: IntCounter,

    /// Orders whose response reached the client
    pub orders_delivered: IntCounter,

    /// Orders aborted after a worker was selected
    pub orders_failed: IntCounter,

    /// Requests rejected before reaching a worker
    pub requests_rejected: IntCounter,

    /// Orders rejected because rotation ran dry
    pub no_workers_available: IntCounter,

    /// Stale rotation entries dropped during selection
    pub stale_entries_skipped: IntCounter,

    /// Rotation queue compactions
    pub queue_compactions: IntCounter,

    /// Workers currently on duty
    pub active_workers: IntGauge,

    /// Full relay duration
    pub relay_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let joins_total = IntCounter::new(
            "dispatcher_joins_total",
            "Total number of workers that came on duty",
        )
        .unwrap();

        let leaves_total = IntCounter::new(
            "dispatcher_leaves_total",
            "Total number of workers that went off duty",
        )
        .unwrap();

        let orders_routed = IntCounter::new(
            "dispatcher_orders_routed_total",
            "Total number of orders assigned to a worker",
        )
        .unwrap();

        let orders_delivered = IntCounter::new(
            "dispatcher_orders_delivered_total",
            "Total number of orders answered back to the client",
        )
        .unwrap();

        let orders_failed = IntCounter::new(
            "dispatcher_orders_failed_total",
            "Total number of orders aborted mid-relay",
        )
        .unwrap();

        let requests_rejected = IntCounter::new(
            "dispatcher_requests_rejected_total",
            "Total number of requests rejected at the boundary",
        )
        .unwrap();

        let no_workers_available = IntCounter::new(
            "dispatcher_no_workers_available_total",
            "Total orders rejected due to no workers",
        )
        .unwrap();

        let stale_entries_skipped = IntCounter::new(
            "dispatcher_stale_entries_skipped_total",
            "Total stale rotation entries dropped during selection",
        )
        .unwrap();

        let queue_compactions = IntCounter::new(
            "dispatcher_queue_compactions_total",
            "Total rotation queue compactions",
        )
        .unwrap();

        let active_workers = IntGauge::new(
            "dispatcher_active_workers",
            "Current number of workers on duty",
        )
        .unwrap();

        let relay_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "dispatcher_relay_duration_seconds",
                "Order relay duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(joins_total.clone())).unwrap();
        registry.register(Box::new(leaves_total.clone())).unwrap();
        registry.register(Box::new(orders_routed.clone())).unwrap();
        registry.register(Box::new(orders_delivered.clone())).unwrap();
        registry.register(Box::new(orders_failed.clone())).unwrap();
        registry.register(Box::new(requests_rejected.clone())).unwrap();
        registry.register(Box::new(no_workers_available.clone())).unwrap();
        registry.register(Box::new(stale_entries_skipped.clone())).unwrap();
        registry.register(Box::new(queue_compactions.clone())).unwrap();
        registry.register(Box::new(active_workers.clone())).unwrap();
        registry.register(Box::new(relay_duration.clone())).unwrap();

        let dispatcher = DispatcherMetrics {
            joins_total,
            leaves_total,
            orders_routed,
            orders_delivered,
            orders_failed,
            requests_rejected,
            no_workers_available,
            stale_entries_skipped,
            queue_compactions,
            active_workers,
            relay_duration,
        };

        MetricsRegistry {
            registry,
            dispatcher,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Prometheus metrics collection and export.
//!
//! Counters follow the adapter naming of the proxy: each listener kind
//! (`http`, `grpc`, `tcp`, `tcp_sni`, `tcp_dynamic`) reports connections,
//! failures, and no-route events under its own label, and every target
//! carries a request timer keyed by its table entry.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};

/// Labels for HTTP/gRPC request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Listener kind (http, grpc).
    pub proto: String,
    /// HTTP method or gRPC full method.
    pub method: String,
    /// Response status code.
    pub status: String,
}

/// Labels for per-target request timers.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TargetLabels {
    /// Timer handle of the target (`service.host/path`).
    pub target: String,
}

/// Labels for connection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnLabels {
    /// Listener kind (http, grpc, tcp, tcp_sni, tcp_dynamic).
    pub proto: String,
    /// Connection event (conn, connfail, closed).
    pub state: String,
}

/// Labels for no-route events.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NoRouteLabels {
    /// Listener kind that observed the miss.
    pub proto: String,
}

/// Global metrics registry, initialized once and shared across tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the proxy.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<RequestLabels, Histogram>,
    target_duration_seconds: Family<TargetLabels, Histogram>,
    connections_total: Family<ConnLabels, Counter>,
    noroute_total: Family<NoRouteLabels, Counter>,
    tls_handshake_errors_total: Counter,
    table_version: Gauge<i64, AtomicI64>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "requests_total",
            "Total number of proxied requests",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 13))
            });
        registry.register(
            "request_duration_seconds",
            "Proxied request latency in seconds",
            request_duration_seconds.clone(),
        );

        let target_duration_seconds =
            Family::<TargetLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 13))
            });
        registry.register(
            "target_duration_seconds",
            "Per-target request latency in seconds",
            target_duration_seconds.clone(),
        );

        let connections_total = Family::<ConnLabels, Counter>::default();
        registry.register(
            "connections_total",
            "Connection events per listener kind",
            connections_total.clone(),
        );

        let noroute_total = Family::<NoRouteLabels, Counter>::default();
        registry.register(
            "noroute_total",
            "Requests and connections with no matching route",
            noroute_total.clone(),
        );

        let tls_handshake_errors_total = Counter::default();
        registry.register(
            "tls_handshake_errors_total",
            "Failed TLS handshakes",
            tls_handshake_errors_total.clone(),
        );

        let table_version = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "table_version",
            "Monotonic version of the published routing table",
            table_version.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            target_duration_seconds,
            connections_total,
            noroute_total,
            tls_handshake_errors_total,
            table_version,
        }
    }

    /// Records a proxied request with its latency.
    pub fn record_request(proto: &str, method: &str, status: u16, duration_secs: f64) {
        let labels = RequestLabels {
            proto: proto.to_string(),
            method: method.to_string(),
            status: status.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_total.get_or_create(&labels).inc();
            metrics
                .request_duration_seconds
                .get_or_create(&labels)
                .observe(duration_secs);
        }
    }

    /// Records a request against a target's timer.
    pub fn record_target(timer_name: &str, duration_secs: f64) {
        let labels = TargetLabels {
            target: timer_name.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .target_duration_seconds
                .get_or_create(&labels)
                .observe(duration_secs);
        }
    }

    /// Records a connection event (`conn`, `connfail`, `closed`).
    pub fn record_connection(proto: &str, state: &str) {
        let labels = ConnLabels {
            proto: proto.to_string(),
            state: state.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.connections_total.get_or_create(&labels).inc();
        }
    }

    /// Increments the no-route counter for an adapter.
    pub fn inc_noroute(proto: &str) {
        let labels = NoRouteLabels {
            proto: proto.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.noroute_total.get_or_create(&labels).inc();
        }
    }

    /// Increments the TLS handshake failure counter.
    pub fn inc_tls_handshake_error() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.tls_handshake_errors_total.inc();
        }
    }

    /// Bumps the published-table version gauge.
    pub fn set_table_version(version: i64) {
        if let Ok(metrics) = METRICS.lock() {
            metrics.table_version.set(version);
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}

//! Prometheus metrics for the proxy core.
//!
//! Registration mirrors the original sniproxy's metric names and label
//! shapes; they are extended here for the added protocol/outcome axes and
//! for the registry error taxonomy.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

pub struct ProxyMetrics {
    pub bytes_transferred: IntCounterVec,
    pub connections_total: IntCounterVec,
    pub connections_active: IntGauge,
    pub errors_total: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new(registry: &Registry) -> Self {
        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "relay_bytes_transferred_total",
                "Total bytes transferred per domain and direction",
            ),
            &["domain", "direction"],
        )
        .expect("static metric definition");
        registry
            .register(Box::new(bytes_transferred.clone()))
            .expect("metric registered once");

        let connections_total = IntCounterVec::new(
            Opts::new(
                "relay_connections_total",
                "Total connections handled, by protocol and outcome",
            ),
            &["protocol", "outcome"],
        )
        .expect("static metric definition");
        registry
            .register(Box::new(connections_total.clone()))
            .expect("metric registered once");

        let connections_active = IntGauge::new(
            "relay_connections_active",
            "Number of connections currently in TUNNELING state",
        )
        .expect("static metric definition");
        registry
            .register(Box::new(connections_active.clone()))
            .expect("metric registered once");

        let errors_total = IntCounterVec::new(
            Opts::new("relay_errors_total", "Total errors, by taxonomy category"),
            &["kind"],
        )
        .expect("static metric definition");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("metric registered once");

        Self {
            bytes_transferred,
            connections_total,
            connections_active,
            errors_total,
        }
    }

    pub fn record_error(&self, kind: crate::error::ErrorKind) {
        let label = match kind {
            crate::error::ErrorKind::Config => "config",
            crate::error::ErrorKind::Client => "client",
            crate::error::ErrorKind::Upstream => "upstream",
            crate::error::ErrorKind::Registry => "registry",
            crate::error::ErrorKind::Internal => "internal",
        };
        self.errors_total.with_label_values(&[label]).inc();
    }
}

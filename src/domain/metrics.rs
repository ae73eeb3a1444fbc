//! Prometheus metrics for the domain controller.
//!
//! All metrics are registered to a custom registry with the "domainlink"
//! prefix to avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors are handled gracefully: if a
//! metric fails to register, a detached fallback metric is used instead of
//! panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for domainlink metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("domainlink".to_string()), None).unwrap_or_else(|_| Registry::new())
});

/// Register an IntGauge safely, returning an unregistered fallback on error.
fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounter safely, returning an unregistered fallback on error.
fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

/// Register an IntCounterVec safely, returning an unregistered fallback on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning an unregistered fallback on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric name/help should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Currently open host-controller connections.
pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge_safe(
        &REGISTRY,
        "active_connections",
        "Currently open host-controller connections",
    )
});

/// Currently registered host controllers.
pub static REGISTERED_HOSTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge_safe(
        &REGISTRY,
        "registered_hosts",
        "Currently registered host controllers",
    )
});

/// Registration attempts by outcome (committed, rolled_back, conflict,
/// failed, unsupported_version).
pub static REGISTRATION_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "registration_attempts_total",
        "Registration attempts by outcome",
        &["outcome"],
    )
});

/// Heartbeat probes by result (healthy, skipped, desync, timeout,
/// protocol_error).
pub static HEARTBEAT_PROBES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "heartbeat_probes_total",
        "Heartbeat probes by result",
        &["result"],
    )
});

/// Operations forwarded to hosts by outcome (success, failed, rejected).
pub static FORWARDED_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "forwarded_operations_total",
        "Operations forwarded to host controllers by outcome",
        &["outcome"],
    )
});

/// Resources piggybacked onto outbound operations.
pub static PIGGYBACKED_RESOURCES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_safe(
        &REGISTRY,
        "piggybacked_resources_total",
        "Resources piggybacked onto outbound operations",
    )
});

/// Request handling latency by opcode and status.
pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec_safe(
        &REGISTRY,
        "request_duration_seconds",
        "Request handling latency by opcode and status",
        &["op", "status"],
        vec![0.001, 0.005, 0.025, 0.1, 0.5, 2.5, 10.0],
    )
});

/// Record one handled request.
pub fn record_request(op: &str, status: &str, duration_secs: f64) {
    REQUEST_DURATION
        .with_label_values(&[op, status])
        .observe(duration_secs);
}

/// Render all metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_update() {
        ACTIVE_CONNECTIONS.inc();
        ACTIVE_CONNECTIONS.dec();
        REGISTERED_HOSTS.set(0);
        REGISTRATION_ATTEMPTS.with_label_values(&["committed"]).inc();
        HEARTBEAT_PROBES.with_label_values(&["healthy"]).inc();
        FORWARDED_OPERATIONS.with_label_values(&["success"]).inc();
        PIGGYBACKED_RESOURCES.inc();
        record_request("register_host", "success", 0.01);
    }

    #[test]
    fn gather_renders_prefixed_names() {
        REGISTRATION_ATTEMPTS.with_label_values(&["committed"]).inc();
        let rendered = gather();
        assert!(rendered.contains("domainlink_registration_attempts_total"));
    }
}

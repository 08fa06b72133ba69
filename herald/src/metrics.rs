//! Prometheus metrics instrumentation for herald.
//!
//! All metrics are compiled only with the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `herald_claims_total` - Claim-side outcomes by `outcome`
//! - `herald_dispatches_total` - Gateway outcomes by `outcome`
//! - `herald_tokens_total` - Per-token delivery results by `result`
//!
//! ## Gauges
//! - `herald_dispatch_in_flight` - Gateway calls currently running
//!
//! ## Histograms
//! - `herald_gateway_latency_seconds` - Gateway call duration by `status`
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts,
    Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for herald metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static CLAIMS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("herald_claims_total", "Claim outcomes per job");
    CounterVec::new(opts, &["outcome"])
        .expect("herald_claims_total metric creation failed")
});

pub static DISPATCHES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts =
        Opts::new("herald_dispatches_total", "Gateway outcomes per job");
    CounterVec::new(opts, &["outcome"])
        .expect("herald_dispatches_total metric creation failed")
});

/// Labels:
/// - `result`: `success` or `failure`
pub static TOKENS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "herald_tokens_total",
        "Device tokens reported by the gateway",
    );
    CounterVec::new(opts, &["result"])
        .expect("herald_tokens_total metric creation failed")
});

pub static DISPATCH_IN_FLIGHT: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "herald_dispatch_in_flight",
        "Gateway calls currently in flight",
    )
    .expect("herald_dispatch_in_flight metric creation failed")
});

pub static GATEWAY_LATENCY_SECONDS: LazyLock<HistogramVec> =
    LazyLock::new(|| {
        let buckets = exponential_buckets(0.005, 2.0, 14)
            .expect("bucket creation failed");
        let opts = HistogramOpts::new(
            "herald_gateway_latency_seconds",
            "Gateway call duration in seconds",
        )
        .buckets(buckets);
        HistogramVec::new(opts, &["status"])
            .expect("herald_gateway_latency_seconds metric creation failed")
    });

/// Register all metrics with the global registry.
///
/// Idempotent: duplicate registrations are ignored.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(CLAIMS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(DISPATCHES_TOTAL.clone()),
        Box::new(TOKENS_TOTAL.clone()),
        Box::new(DISPATCH_IN_FLIGHT.clone()),
        Box::new(GATEWAY_LATENCY_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted")
            {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_claim_outcome(outcome: &str) {
    CLAIMS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_dispatch_outcome(outcome: &str) {
    DISPATCHES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_tokens(success: usize, failure: usize) {
    if success > 0 {
        TOKENS_TOTAL
            .with_label_values(&["success"])
            .inc_by(success as f64);
    }
    if failure > 0 {
        TOKENS_TOTAL
            .with_label_values(&["failure"])
            .inc_by(failure as f64);
    }
}

pub fn set_in_flight(in_flight: f64) {
    DISPATCH_IN_FLIGHT.set(in_flight);
}

pub fn observe_gateway_latency(status: &str, duration_secs: f64) {
    GATEWAY_LATENCY_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_claim_outcome("dispatched");
        record_dispatch_outcome("partially_delivered");
        record_tokens(3, 1);
        set_in_flight(2.0);
        observe_gateway_latency("delivered", 0.12);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("herald_claims_total"));
        assert!(output.contains("herald_tokens_total"));
        assert!(output.contains("herald_gateway_latency_seconds"));
    }
}

//! Spawn metrics
//!
//! Counters and histograms exported for the hub's metrics endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SPAWNS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("labpod_spawns_total", "Spawn attempts started").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SPAWN_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("labpod_spawn_failures_total", "Spawn failures by reason"),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static STOPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("labpod_stops_total", "Lab stops by reason"),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SPAWN_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "labpod_spawn_duration_seconds",
            "Time from spawn request to Running",
        )
        .buckets(vec![
            1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("labpod_active_sessions", "Sessions currently tracked").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Render all labpod metrics in the Prometheus text format
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_failure_counter_labels() {
        let before = SPAWN_FAILURES.with_label_values(&["image_pull_timeout"]).get();
        SPAWN_FAILURES.with_label_values(&["image_pull_timeout"]).inc();
        assert_eq!(
            SPAWN_FAILURES.with_label_values(&["image_pull_timeout"]).get(),
            before + 1
        );
    }

    #[test]
    #[serial]
    fn test_render_includes_registered_metrics() {
        SPAWNS_TOTAL.inc();
        let text = render();
        assert!(text.contains("labpod_spawns_total"));
    }
}

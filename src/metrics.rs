//! Prometheus metrics, registered once behind `LazyLock`.

use std::sync::LazyLock;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static SYNC_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("netpol_sync_total", "Total full syncs attempted").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static SYNC_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("netpol_sync_errors_total", "Total full syncs that failed").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static SYNC_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(HistogramOpts::new("netpol_sync_duration_seconds", "Full sync wall-clock duration")).unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static ACTIVE_CHAINS: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("netpol_active_chains", "Chains active after the last sync").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static ACTIVE_IPSETS: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("netpol_active_ipsets", "IP sets active after the last sync").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static STALE_CHAINS_COLLECTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("netpol_stale_chains_collected_total", "Stale chains removed by the garbage collector").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static STALE_IPSETS_COLLECTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("netpol_stale_ipsets_collected_total", "Stale ip sets removed by the garbage collector").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static PODS_TRACKED: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("netpol_pods_tracked", "Pods seen in the last sync's lister snapshot").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static POLICIES_TRACKED: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("netpol_policies_tracked", "Policies seen in the last sync's lister snapshot").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Forces registration of every metric above. Call once at startup so
/// `/metrics` is never empty before the first sync completes.
pub fn init() {
    LazyLock::force(&SYNC_TOTAL);
    LazyLock::force(&SYNC_ERRORS_TOTAL);
    LazyLock::force(&SYNC_DURATION_SECONDS);
    LazyLock::force(&ACTIVE_CHAINS);
    LazyLock::force(&ACTIVE_IPSETS);
    LazyLock::force(&STALE_CHAINS_COLLECTED_TOTAL);
    LazyLock::force(&STALE_IPSETS_COLLECTED_TOTAL);
    LazyLock::force(&PODS_TRACKED);
    LazyLock::force(&POLICIES_TRACKED);
}

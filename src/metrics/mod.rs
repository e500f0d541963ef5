
use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

lazy_static! {
    pub static ref WATCH_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_events_total", "Watch events dispatched to callbacks"),
        &["prefix", "op"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_RECOVERIES: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_recoveries_total", "Watch stream recovery attempts"),
        &["prefix", "action"]
    )
    .expect("metric can not be created");

    pub static ref LEASE_REBOOTSTRAPS: IntCounterVec = IntCounterVec::new(
        Opts::new("lease_rebootstraps_total", "Lease re-acquisition attempts"),
        &["result"]
    )
    .expect("metric can not be created");

    pub static ref CACHE_DECODE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_decode_failures_total", "Store entries skipped during cache ingestion"),
        &["category"]
    )
    .expect("metric can not be created");

    pub static ref CACHED_SERVERS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("cached_servers", "Servers currently cached per type"),
        &["server_type"]
    )
    .expect("metric can not be created");

    /// Numeric `RegistryState` of this process
    pub static ref REGISTRY_STATE: IntGauge =
        IntGauge::new("registry_state", "Lifecycle state of the local registry")
            .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

pub fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(WATCH_EVENTS.clone()),
        Box::new(WATCH_RECOVERIES.clone()),
        Box::new(LEASE_REBOOTSTRAPS.clone()),
        Box::new(CACHE_DECODE_FAILURES.clone()),
        Box::new(CACHED_SERVERS.clone()),
        Box::new(REGISTRY_STATE.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            // AlreadyReg when the exporter is restarted in-process
            error!(error = %e, "collector can not be registered");
        }
    }
}

/// Serves `/metrics` on `port` until `shutdown_signal` changes.
pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    register_custom_metrics(&REGISTRY);

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);

    let (addr, server) =
        warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            let _ = shutdown_signal.changed().await;
        });
    info!(%addr, "metrics exporter listening");
    server.await;
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(gather_text())
}

/// Text exposition of the custom registry
pub fn gather_text() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!(error = %e, "could not encode custom metrics");
    }
    match String::from_utf8(buffer) {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "custom metrics could not be from_utf8'd");
            String::default()
        }
    }
}

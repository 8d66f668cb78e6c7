use std::net::SocketAddr;
use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::GaugeVec;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use warp::Filter;
use warp::Rejection;
use warp::Reply;


lazy_static! {
    pub static ref SYNC_WRITER_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("sync_writer_events_total", "Sync writer lifecycle and per-event outcomes"),
        &["event"]
    )
    .expect("metric can not be created");

    pub static ref PATH_WATCHER_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("path_watcher_events_total", "Path watcher lifecycle and handled events"),
        &["path", "event"]
    )
    .expect("metric can not be created");

    pub static ref PATH_WATCHER_REVISION: GaugeVec = GaugeVec::new(
        Opts::new("path_watcher_revision", "Last revision processed by a path watcher"),
        &["path"]
    )
    .expect("metric can not be created");

    pub static ref STATE_UPDATE_DURATION_MS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("state_update_duration_ms", "Duration of state and monitoring updates in ms")
            .buckets(exponential_buckets(1.0, 2.0, 14).expect("buckets are valid")),
        &["schema", "event"]
    )
    .expect("metric can not be created");

    pub static ref SYNC_OPS: IntCounterVec = IntCounterVec::new(
        Opts::new("sync_ops_total", "Coordination store writes issued by the sync writer"),
        &["op", "outcome"]
    )
    .expect("metric can not be created");

    pub static ref EVENT_LOGGER_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("event_logger_events_total", "Event rows written by event-logging transactions"),
        &["event"]
    )
    .expect("metric can not be created");

    pub static ref COMMIT_INFORMER_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("commit_informer_total", "Commit notifications received, dropped and published"),
        &["event"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

pub(crate) fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(SYNC_WRITER_EVENTS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(PATH_WATCHER_EVENTS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(PATH_WATCHER_REVISION.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(STATE_UPDATE_DURATION_MS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SYNC_OPS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(EVENT_LOGGER_EVENTS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(COMMIT_INFORMER_EVENTS.clone()))
        .expect("collector can be registered");
}

/// Serves `/metrics` until `shutdown` is cancelled.
pub async fn start_server(
    addr: SocketAddr,
    shutdown: CancellationToken,
) {
    REGISTER.call_once(|| register_custom_metrics(&REGISTRY));

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);

    let (addr, server) =
        warp::serve(metrics_route).bind_with_graceful_shutdown(addr, async move {
            shutdown.cancelled().await;
        });
    info!("metrics endpoint listening on {}", addr);
    server.await;
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(gather_metrics())
}

/// Text exposition of the crate registry followed by the default registry.
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    };
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!("could not encode prometheus metrics: {}", e);
    };
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}

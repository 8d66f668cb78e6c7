use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use gohan::config::Settings;
use gohan::db::MemDatabase;
use gohan::extension::ExtensionRegistry;
use gohan::metrics;
use gohan::schema::SchemaManager;
use gohan::server::Server;
use gohan::sync::MemStore;
use gohan::sync::MemSync;
use gohan::Result;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let mut settings = Settings::load()?;
    let process_id = settings.cluster.resolve_process_id();
    settings.cluster.process_id = Some(process_id.clone());

    // Initializing Logs
    let _guard = init_observability(&process_id, &settings.cluster.log_dir)?;

    let cancel = CancellationToken::new();

    if settings.monitoring.prometheus_enabled {
        let addr = settings.monitoring.metrics_addr();
        let shutdown = cancel.clone();
        tokio::spawn(async move { metrics::start_server(addr, shutdown).await });
    }

    // Standalone member: in-process coordination store and database
    let schemas = Arc::new(SchemaManager::new());
    let store = MemStore::new();
    let client = Arc::new(MemSync::new(store, process_id.clone(), settings.cluster.master_ttl()));
    let backend = Arc::new(MemDatabase::new(schemas.clone()));

    let mut server = Server::new(settings, schemas, client, backend, ExtensionRegistry::new());
    let handles = server.start(&cancel)?;

    info!(%process_id, "application started. Waiting for CTRL+C signal...");
    if let Err(e) = graceful_shutdown(&cancel).await {
        error!("failed to listen for shutdown signals: {:?}", e);
    }
    cancel.cancel();

    if timeout(SHUTDOWN_TIMEOUT, join_all(handles)).await.is_err() {
        warn!("background tasks did not stop within {:?}", SHUTDOWN_TIMEOUT);
    }
    info!("Exiting program.");
    Ok(())
}

async fn graceful_shutdown(cancel: &CancellationToken) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = cancel.cancelled() => {},
    }
    info!("Shutdown server..");
    Ok(())
}

pub fn init_observability(
    process_id: &str,
    log_dir: &Path,
) -> Result<WorkerGuard> {
    let log_file = tracing_appender::rolling::never(log_dir.join(process_id), "gohan.log");

    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(base_subscriber).init();

    Ok(guard)
}

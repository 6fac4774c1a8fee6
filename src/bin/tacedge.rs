//! TacEdge relay process: wires C1-C5 together, starts the dispatcher and
//! the HTTP gateway, and shuts both down gracefully on SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use tacedge::audit::AuditLog;
use tacedge::auth::TokenService;
use tacedge::config::TacEdgeConfig;
use tacedge::crypto::CryptoSealer;
use tacedge::dispatch::DispatchWorker;
use tacedge::gateway::rate_limit::RateLimiter;
use tacedge::gateway::{router, AppState, Backpressure};
use tacedge::logging;
use tacedge::monitor::{AlertConfig, ProductionMonitor};
use tacedge::queue::PrecedenceQueue;
use tacedge::registry::NodeRegistry;
use tacedge::transport::HttpNodeTransport;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let config = TacEdgeConfig::load(std::env::args().nth(1).as_deref())?;
    logging::init(config.log_format);
    install_metrics_recorder();

    tracing::info!(data_dir = %config.data_dir, http_bind = %config.http_bind, "starting tacedge");

    let db = sled::open(&config.data_dir)?;
    let audit = AuditLog::open(&db)?;
    let queue = PrecedenceQueue::open(db)?;
    let crypto = Arc::new(CryptoSealer::new(
        &config.content_encryption_key,
        config.key_version,
        audit.clone(),
    )?);
    let registry = Arc::new(NodeRegistry::new(chrono::Duration::seconds(
        config.heartbeat_threshold_s as i64,
    )));
    let monitor = Arc::new(ProductionMonitor::new(AlertConfig::default()));
    let tokens = Arc::new(TokenService::new(config.token_signing_key.to_vec()));
    let transport: Arc<dyn tacedge::transport::NodeTransport> = Arc::new(HttpNodeTransport::new());
    let flash_notify = Arc::new(tokio::sync::Notify::new());
    let shutdown = CancellationToken::new();

    let worker = Arc::new(DispatchWorker::new(
        queue.clone(),
        audit.clone(),
        transport,
        monitor.clone(),
        registry.clone(),
        config.clone(),
        flash_notify.clone(),
    ));
    let dispatch_handle = tokio::spawn(worker.run(shutdown.clone()));

    let state = AppState {
        queue,
        audit,
        crypto,
        registry,
        monitor,
        tokens,
        config: Arc::new(config.clone()),
        rate_limiter: Arc::new(RateLimiter::new()),
        backpressure: Arc::new(Backpressure::new()),
        flash_notify,
    };

    let addr: SocketAddr = config.http_bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");

    let app = router(state);
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown_signal(shutdown.clone()));

    server.await?;
    shutdown.cancel();
    dispatch_handle.await?;

    tracing::info!("tacedge shut down cleanly");
    Ok(())
}

/// Installs a Prometheus recorder for the `metrics` macro calls in
/// `monitor.rs` when built with the `prometheus-exporter` feature.
/// Without the feature, `metrics`'s default no-op recorder is used and
/// every `counter!`/`gauge!`/`histogram!` call is simply discarded.
#[cfg(feature = "prometheus-exporter")]
fn install_metrics_recorder() {
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        tracing::warn!(error = %e, "failed to install prometheus recorder");
    }
}

#[cfg(not(feature = "prometheus-exporter"))]
fn install_metrics_recorder() {}

async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, draining in-flight dispatch");
    shutdown.cancel();
}

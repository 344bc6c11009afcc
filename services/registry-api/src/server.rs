use crate::cli::ServeArgs;
use crate::infra::AppState;
use crate::routes::with_registry_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use civil_registry::config::AppConfig;
use civil_registry::error::AppError;
use civil_registry::telemetry;
use civil_registry::workflows::registry::{MemoryRegistryStore, RegistryServices};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let store = Arc::new(MemoryRegistryStore::with_outbox_retention(
        config.registry.outbox_retention,
    ));
    let services = Arc::new(RegistryServices::new(store, &config.registry)?);

    let (stop_worker, worker_stopped) = oneshot::channel::<()>();
    let worker = services.outbox_worker().spawn(async move {
        let _ = worker_stopped.await;
    });

    let app = with_registry_routes(Arc::clone(&services))
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        ticket_max_attempts = config.registry.ticket_max_attempts,
        outbox_interval_ms = config.registry.outbox_poll_interval.as_millis() as u64,
        "civil registry service ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    readiness_flag.store(false, Ordering::Release);
    let _ = stop_worker.send(());
    if let Err(err) = worker.await {
        warn!(error = %err, "outbox worker ended abnormally");
    }

    // Deliver whatever was committed after the worker's last pass.
    let report = services.notifications.drain_outbox()?;
    info!(delivered = report.delivered, retrying = report.retrying, "civil registry service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

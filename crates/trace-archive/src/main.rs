//! Trace Archive binary entry point.
//!
//! Starts the archive pipeline with:
//! - OTLP gRPC receiver (port 4317)
//! - OTLP HTTP receiver (port 4318)
//! - Stream API and Prometheus metrics (port 3100)

use std::future::IntoFuture;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server as TonicServer;
use tower_http::trace::TraceLayer;
use trace_archive::{storage::create_object_store, ArchiveConfig, ArchiveService};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ArchiveConfig::load()?;
    init_tracing(config.log.json);

    tracing::info!(
        grpc_addr = %config.server.grpc_addr,
        http_addr = %config.server.http_addr,
        api_addr = %config.server.api_addr,
        index = config.index.endpoint.as_deref().unwrap_or("disabled"),
        "Configuration loaded"
    );

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let store = create_object_store(&config.storage)?;
    let service = ArchiveService::start(&config, store)?;
    tracing::info!(
        streams = service.streams().iter().count(),
        "Archive pipeline started"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let grpc_addr = config.server.grpc_addr;
    let http_addr = config.server.http_addr;
    let api_addr = config.server.api_addr;

    let grpc_server = TonicServer::builder()
        .add_service(service.grpc_service())
        .serve_with_shutdown(grpc_addr, shutdown.clone().cancelled_owned());

    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_server = axum::serve(
        http_listener,
        service.http_router().layer(TraceLayer::new_for_http()),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .into_future();

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let api_server = axum::serve(
        api_listener,
        service.api_router(Some(metrics)).layer(TraceLayer::new_for_http()),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .into_future();

    tracing::info!(
        grpc = %grpc_addr,
        http = %http_addr,
        api = %api_addr,
        "Servers starting"
    );

    // Any server exiting takes the others down with it.
    let (grpc, http, api) = tokio::join!(
        stop_all_after(&shutdown, grpc_server),
        stop_all_after(&shutdown, http_server),
        stop_all_after(&shutdown, api_server),
    );
    if let Err(e) = grpc {
        tracing::error!(error = %e, "gRPC server error");
    }
    if let Err(e) = http {
        tracing::error!(error = %e, "HTTP OTLP server error");
    }
    if let Err(e) = api {
        tracing::error!(error = %e, "Stream API server error");
    }

    tracing::info!("Shutting down background tasks");
    let stats = service.shutdown().await;
    tracing::info!(
        extractions = stats.extraction_invocations,
        extraction_failures = stats.extraction_failures,
        records = stats.records_submitted,
        "Shutdown complete"
    );
    Ok(())
}

async fn stop_all_after<F: std::future::Future>(
    shutdown: &CancellationToken,
    server: F,
) -> F::Output {
    let output = server.await;
    shutdown.cancel();
    output
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "trace_archive=info,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}

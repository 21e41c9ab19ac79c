//! Worker entry point.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::config::{Config, LogFormat};
use worker::routes::dead_letters::AppState;
use worker::{FulfillmentWorker, create_app, create_backends};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration (.env first, then the environment)
    let config = Config::from_env();

    // 2. Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    // 3. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 4. Connect backends and wire the stages
    let backends = create_backends(&config)
        .await
        .expect("failed to connect backends");
    let worker = FulfillmentWorker::new(&config, &backends).expect("invalid worker configuration");
    let state = Arc::new(AppState {
        replayer: worker.replayer.clone(),
    });

    // 5. Start consumers and timers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = worker.spawn(shutdown_rx);
    tracing::info!(
        consumer_id = %config.consumer_id,
        tasks = tasks.len(),
        "pipeline started"
    );

    // 6. Serve the operations API until a stop signal arrives
    let app = create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting worker API");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("server error");

    // 7. Let in-flight events finish and partitions be released
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "worker task panicked");
        }
    }

    tracing::info!("worker shut down gracefully");
}

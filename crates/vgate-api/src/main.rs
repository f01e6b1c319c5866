//! Orchestrator binary.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vgate_api::{create_router, metrics, ApiConfig, AppState, OrchestratorConfig, Runtime};
use vgate_worker::CommandCapability;

const CRATE_TARGETS: [&str; 4] = ["vgate_api", "vgate_ledger", "vgate_queue", "vgate_worker"];

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Already installed is fine
    let _ = rustls::crypto::ring::default_provider().install_default();

    init_tracing();

    info!("Starting vgate-api");

    let config = match ApiConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("API config: host={}, port={}", config.host, config.port);

    let orchestrator_config = match OrchestratorConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Installed before the runtime so start-up slot and queue gauges land
    let metrics_handle = if config.metrics_enabled {
        match metrics::init_metrics() {
            Ok(handle) => {
                info!("Prometheus metrics enabled at /metrics");
                Some(handle)
            }
            Err(e) => {
                warn!("Failed to install Prometheus recorder: {}", e);
                None
            }
        }
    } else {
        None
    };

    let capability = match CommandCapability::from_config(&orchestrator_config.worker) {
        Ok(c) => c,
        Err(e) => {
            error!("Worker command unavailable: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match Runtime::build(&orchestrator_config, Arc::new(capability)).await {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to start orchestrator: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (orchestrator, background) = runtime.spawn(shutdown_rx);

    let app = create_router(AppState::new(config.clone(), orchestrator), metrics_handle);

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid bind address: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Listening on {}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    // Stop supervisors and background services, letting in-flight jobs drain
    let _ = shutdown_tx.send(true);
    join_all(background).await;

    info!("Server shutdown complete");
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = CRATE_TARGETS
        .iter()
        .filter_map(|target| format!("{}=info", target).parse::<Directive>().ok())
        .fold(EnvFilter::from_default_env(), |filter, directive| {
            filter.add_directive(directive)
        });

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

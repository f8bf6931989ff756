use std::sync::Arc;

use anyhow::Context;
use courier_push::broker::{BrokerTransport, MemoryBroker};
use courier_push::PushEngine;
use courier_relay::config::RelayConfig;
use courier_relay::{build_app, AppState};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = RelayConfig::from_env();

    let subscriber =
        tracing_subscriber::fmt().with_env_filter(EnvFilter::new(&config.log_filter));
    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    config.validate();

    // The only transport available in-process; cross-host deployments plug
    // their own `BrokerTransport` into `PushEngine::start`.
    let transport: Option<Arc<dyn BrokerTransport>> = if config.push.broker.enabled {
        info!("using in-process memory broker");
        Some(Arc::new(MemoryBroker::new()))
    } else {
        None
    };

    let engine = Arc::new(
        PushEngine::start(config.push.clone(), transport).context("failed to start push engine")?,
    );
    let app = build_app(
        AppState::new(Arc::clone(&engine), config.connection),
        config.cors_origins.as_deref(),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly");

    engine.stop().await;
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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

    info!("shutdown signal received");
}

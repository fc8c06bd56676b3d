mod engine;
mod hub;
mod problem;
mod protocol;
mod router;
mod sse;
mod tap;
mod telemetry;
mod webhook;
mod ws;

use std::net::SocketAddr;

use subathon_util::{load_env_file, AppConfig};
use tracing::{info, warn};

use crate::engine::{Engine, EngineHandle};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let tap_hub = tap::TapHub::new();
    let (engine, engine_task) = Engine::new(&config.timer, tap_hub.clone()).spawn();
    let state = router::AppState::new(
        metrics,
        tap_hub,
        engine.clone(),
        config.sse_heartbeat_secs,
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal(engine))
        .await?;

    engine_task.await?;
    info!(stage = "app", "server stopped");
    Ok(())
}

// Stopping the engine closes every client channel, which ends open SSE and
// WebSocket sessions so the server can drain.
async fn shutdown_signal(engine: EngineHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(stage = "app", error = %err, "SIGTERM handler unavailable, waiting for ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!(stage = "app", "shutdown requested");
    if let Err(err) = engine.shutdown().await {
        warn!(stage = "app", error = %err, "engine already stopped");
    }
}

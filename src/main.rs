use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

use chatlink::config::{Config, EngineKind};
use chatlink::engine::{CompletionEngine, EchoEngine, RemoteEngine};
use chatlink::gateway::reaper::IdleReaper;
use chatlink::state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatlink=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env();

    let engine: Arc<dyn CompletionEngine> = match (&config.engine, &config.engine_url) {
        (EngineKind::Remote, Some(url)) => Arc::new(RemoteEngine::new(url)),
        _ => Arc::new(EchoEngine::new(config.echo_delay)),
    };
    if let Err(e) = engine.initialize().await {
        tracing::error!("failed to initialize completion engine: {e}");
        return ExitCode::FAILURE;
    }

    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind port {}: {e}", config.port);
            engine.shutdown().await;
            return ExitCode::FAILURE;
        }
    };
    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {addr}"),
        Err(e) => tracing::warn!("failed to read local address: {e}"),
    }

    let state = AppState::new(Arc::clone(&engine));
    let reaper = IdleReaper::spawn(state.sessions.clone(), Arc::clone(&engine), config.reaper);
    let app = chatlink::routes::router(state.clone());

    let shutdown_state = state.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown requested");
            reaper.stop();
            let closed = chatlink::gateway::close_all(&shutdown_state);
            if closed > 0 {
                tracing::info!("closed {} live session(s)", closed);
            }
        })
        .await;

    engine.shutdown().await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

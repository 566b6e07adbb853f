use anyhow::{Context, Result};
use clap::Parser;
use smc::{router, telemetry, AppState};
use smcconf::SmcConfig;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Run commands on demand and stream their output over HTTP
#[derive(Parser, Debug)]
#[command(name = "stream-my-command", version, about, long_about = None)]
struct Cli {
    /// Config file, loaded after the system and user configs
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding stream segments (overrides config)
    #[arg(short, long)]
    state_dir: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "info,longbuffer=debug" (overrides config)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = SmcConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.infra.bind.http_port = port;
    }
    if let Some(state_dir) = cli.state_dir {
        config.infra.paths.state_dir = state_dir;
    }
    if let Some(log_level) = cli.log_level {
        config.infra.telemetry.log_level = log_level;
    }

    telemetry::init(&config.infra.telemetry.log_level)
        .context("Failed to initialize logging")?;

    for file in &sources.files {
        tracing::info!("Loaded config: {}", file.display());
    }
    for var in &sources.env_overrides {
        tracing::info!("Env override: {}", var);
    }

    config.validate().context("Invalid configuration")?;
    if config.commands.is_empty() {
        tracing::warn!("No commands configured, every /api/v1 request will 404");
    }

    let state = AppState::from_config(&config)?;
    std::fs::create_dir_all(&state.streams_dir)
        .with_context(|| format!("Failed to create {}", state.streams_dir.display()))?;
    tracing::info!("Streams directory: {}", state.streams_dir.display());

    for endpoint in state.endpoints.values() {
        tracing::info!(
            command.slug = %endpoint.spec.slug,
            command = %endpoint.spec.command,
            arity = endpoint.arguments.arity(),
            "Registered GET/DELETE /api/v1/{}",
            endpoint.spec.slug
        );
    }

    let registry = state.registry.clone();
    let addr = config.infra.bind.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(
        segment_size = config.infra.stream.segment_size,
        wait_strategy = %config.infra.stream.wait_strategy,
        max_concurrent_commands = config.infra.stream.max_concurrent_commands,
        "Listening on http://{}",
        addr
    );

    let shutdown_token = CancellationToken::new();
    let shutdown_srv = shutdown_token.clone();
    let server = axum::serve(listener, router(state)).with_graceful_shutdown(async move {
        shutdown_srv.cancelled().await;
        tracing::info!("Server shutdown signal received");
    });

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("Server shutdown with error: {:?}", e);
        }
    });

    // Handle both SIGINT (Ctrl+C) and SIGTERM (systemd, containers)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        result = terminate() => {
            result?;
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    // Kill running commands so their streams close and open responses end.
    let cancelled = registry.cancel_all();
    tracing::info!(runs = cancelled, "Cancelled running commands");
    shutdown_token.cancel();

    server_task.await.context("Server task panicked")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn terminate() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

mod bootstrap;
mod health;
mod relay;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use threadline_core::config::{AppConfig, LoadOptions};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use threadline_core::config::LogFormat::*;

    // RUST_LOG wins over the configured level when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging needs the config, so load it before bootstrap.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let bootstrap::Application { config, pipeline, slack_runner } =
        bootstrap::bootstrap_with_config(config)?;
    let shutdown = CancellationToken::new();
    let ingress_running = Arc::new(AtomicBool::new(true));

    health::spawn(
        &config.server.bind_address,
        config.server.health_check_port,
        health::HealthState::new(
            Arc::clone(&pipeline),
            Arc::clone(&ingress_running),
            shutdown.clone(),
        ),
    )
    .await?;

    let indexed_tools = pipeline.registry().discover().await;
    tracing::info!(
        event_name = "system.providers.discovered",
        correlation_id = "bootstrap",
        indexed_tools,
        "tool providers discovered"
    );

    let sweep_interval = config.pipeline.sweep_interval();
    let provider_sweeper =
        Arc::clone(pipeline.registry()).spawn_sweeper(sweep_interval, shutdown.clone());
    let thread_sweeper = pipeline.spawn_thread_sweeper(sweep_interval, shutdown.clone());

    let runner = tokio::spawn({
        let shutdown = shutdown.clone();
        let ingress_running = Arc::clone(&ingress_running);
        async move {
            let result = slack_runner.start(shutdown).await;
            ingress_running.store(false, Ordering::Relaxed);
            result
        }
    });

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        "threadline-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "threadline-server stopping"
    );

    shutdown.cancel();
    let summary = pipeline.shutdown().await;

    let grace = Duration::from_secs(config.server.graceful_shutdown_secs);
    let drained = tokio::time::timeout(grace, async {
        match runner.await {
            Ok(Err(error)) => tracing::warn!(
                event_name = "system.server.ingress_failed",
                correlation_id = "shutdown",
                error = %error,
                "slack runner exited with an error"
            ),
            Err(error) => tracing::warn!(
                event_name = "system.server.ingress_failed",
                correlation_id = "shutdown",
                error = %error,
                "slack runner task ended abnormally"
            ),
            Ok(Ok(())) => {}
        }
        let _ = provider_sweeper.await;
        let _ = thread_sweeper.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = config.server.graceful_shutdown_secs,
            "background tasks did not stop within the grace period"
        );
    }

    tracing::info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        cancelled_runs = summary.cancelled_runs,
        closed_connections = summary.closed_connections,
        "threadline-server stopped"
    );
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use threadline_agent::runtime::{ConversationPipeline, PipelineHealth};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    pipeline: Arc<ConversationPipeline>,
    ingress_running: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl HealthState {
    pub fn new(
        pipeline: Arc<ConversationPipeline>,
        ingress_running: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { pipeline, ingress_running, shutdown }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub ingress: HealthCheck,
    pub pipeline: PipelineHealth,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, state: HealthState) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let server = axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(error) = server.await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let stopping = state.shutdown.is_cancelled();
    let ingress = if state.ingress_running.load(Ordering::Relaxed) {
        HealthCheck { status: "ready", detail: "slack socket mode runner active".to_string() }
    } else {
        HealthCheck { status: "degraded", detail: "slack socket mode runner stopped".to_string() }
    };
    let ready = !stopping && ingress.status == "ready";

    let payload = HealthResponse {
        status: if stopping {
            "stopping"
        } else if ready {
            "ready"
        } else {
            "degraded"
        },
        service: HealthCheck {
            status: if stopping { "stopping" } else { "ready" },
            detail: "threadline-server runtime initialized".to_string(),
        },
        ingress,
        pipeline: state.pipeline.health().await,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

use std::sync::Arc;
use std::time::Duration;

use threadline_core::config::PipelineConfig;
use threadline_core::domain::run::RunId;
use threadline_core::domain::thread::ThreadKey;
use threadline_core::domain::tool::{
    ToolCallRequest, ToolDescriptor, ToolFailureKind, ToolResult,
};
use threadline_core::provider::ProviderCallError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::{HealthState, ProviderRegistry, RegistryError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Identity of the run issuing a tool call, used for correlation and to stop
/// retrying once the run is cancelled.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub thread_key: ThreadKey,
    pub cancel: CancellationToken,
}

enum AttemptError {
    Unavailable(String),
    Call(ProviderCallError),
}

pub struct ToolOrchestrator {
    registry: Arc<ProviderRegistry>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ToolOrchestrator {
    pub fn new(registry: Arc<ProviderRegistry>, config: &PipelineConfig) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.tool_retry_limit.max(1),
            base_delay_ms: config.tool_retry_backoff_ms,
            ..RetryPolicy::default()
        };
        Self { registry, timeout: config.tool_timeout(), retry }
    }

    pub fn with_policy(registry: Arc<ProviderRegistry>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self { registry, timeout, retry }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Tools advertised to the model. Providers not yet connected are
    /// connected first so their capabilities are known.
    pub async fn available_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.discover_unindexed().await;
        let mut tools = Vec::new();
        for name in self.registry.tool_names().await {
            if let Some(provider_key) = self.registry.provider_for(&name).await {
                tools.push(ToolDescriptor { name, provider_key });
            }
        }
        tools
    }

    /// Executes one tool call. Every failure comes back as a failed
    /// `ToolResult` so the generation loop can decide how to continue.
    pub async fn invoke(&self, request: &ToolCallRequest, context: &RunContext) -> ToolResult {
        if context.cancel.is_cancelled() {
            return ToolResult::failure(request, ToolFailureKind::Cancelled, "run was cancelled", 0);
        }

        let Some(provider_key) = self.registry.provider_for(&request.tool_name).await else {
            warn!(
                event_name = "tools.invocation.unknown_tool",
                thread_key = %context.thread_key,
                run_id = %context.run_id,
                invocation_id = %request.invocation_id,
                tool_name = %request.tool_name,
                "no provider advertises the requested tool"
            );
            return ToolResult::failure(
                request,
                ToolFailureKind::UnknownTool,
                format!("no provider offers a tool named `{}`", request.tool_name),
                0,
            );
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.attempt(&provider_key, request).await {
                Ok(payload) => {
                    info!(
                        event_name = "tools.invocation.succeeded",
                        thread_key = %context.thread_key,
                        run_id = %context.run_id,
                        invocation_id = %request.invocation_id,
                        provider_key = %provider_key,
                        tool_name = %request.tool_name,
                        attempt,
                        "tool invocation succeeded"
                    );
                    return ToolResult::success(request, payload);
                }
                Err(error) => error,
            };

            let (kind, message, retryable) = match error {
                AttemptError::Unavailable(message) => {
                    (ToolFailureKind::ProviderUnavailable, message, true)
                }
                AttemptError::Call(call_error) => {
                    let retryable = call_error.is_retryable();
                    (failure_kind(&call_error), call_error.to_string(), retryable)
                }
            };

            if !retryable || attempt >= self.retry.max_attempts {
                warn!(
                    event_name = "tools.invocation.failed",
                    thread_key = %context.thread_key,
                    run_id = %context.run_id,
                    invocation_id = %request.invocation_id,
                    provider_key = %provider_key,
                    tool_name = %request.tool_name,
                    attempt,
                    error = %message,
                    "tool invocation failed"
                );
                return ToolResult::failure(request, kind, message, attempt);
            }

            let delay = self.retry.backoff(attempt - 1);
            warn!(
                event_name = "tools.invocation.retry",
                thread_key = %context.thread_key,
                run_id = %context.run_id,
                invocation_id = %request.invocation_id,
                provider_key = %provider_key,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %message,
                "tool invocation attempt failed, retrying"
            );

            tokio::select! {
                _ = context.cancel.cancelled() => {
                    return ToolResult::failure(
                        request,
                        ToolFailureKind::Cancelled,
                        "run was cancelled before the tool call could be retried",
                        attempt,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        provider_key: &threadline_core::domain::tool::ProviderKey,
        request: &ToolCallRequest,
    ) -> Result<serde_json::Value, AttemptError> {
        let connection = match self.registry.resolve(provider_key).await {
            Ok(connection) => connection,
            Err(error @ RegistryError::ProviderConnectFailure { .. }) => {
                return Err(AttemptError::Unavailable(error.to_string()));
            }
            Err(error @ RegistryError::UnknownProvider(_)) => {
                return Err(AttemptError::Call(ProviderCallError::Rejected(error.to_string())));
            }
        };

        let outcome =
            connection.call(&request.tool_name, request.arguments.clone(), self.timeout).await;

        match outcome {
            Ok(payload) => Ok(payload),
            Err(error) => {
                if error.is_connection_level() {
                    self.registry.report_failure(&connection).await;
                } else if matches!(error, ProviderCallError::Timeout { .. }) {
                    connection.set_health(HealthState::Degraded);
                }
                Err(AttemptError::Call(error))
            }
        }
    }
}

fn failure_kind(error: &ProviderCallError) -> ToolFailureKind {
    match error {
        ProviderCallError::Timeout { .. } => ToolFailureKind::Timeout,
        ProviderCallError::Transport(_) => ToolFailureKind::Transport,
        ProviderCallError::InvalidArguments(_) => ToolFailureKind::InvalidArguments,
        ProviderCallError::Rejected(_) => ToolFailureKind::Rejected,
    }
}

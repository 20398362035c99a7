use std::sync::Arc;

use async_trait::async_trait;
use threadline_agent::runtime::{ConversationPipeline, SubmitOutcome};
use threadline_core::domain::event::InboundEvent;
use threadline_slack::{EventContext, EventHandlerError, ThreadMessageService};
use tracing::{debug, info, warn};

/// Hands accepted Slack messages to the conversation pipeline. Runs execute
/// on pipeline tasks; this only logs how each one ended.
pub struct RelayService {
    pipeline: Arc<ConversationPipeline>,
}

impl RelayService {
    pub fn new(pipeline: Arc<ConversationPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ThreadMessageService for RelayService {
    async fn handle_thread_message(
        &self,
        event: InboundEvent,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError> {
        let thread_key = event.thread_key.clone();
        let outcome = self.pipeline.submit(event).await.map_err(|error| {
            let error = error.into_interface(ctx.correlation_id.clone());
            warn!(
                event_name = "relay.message.rejected",
                correlation_id = %error.correlation_id(),
                thread_key = %thread_key,
                error = %error,
                "pipeline rejected message"
            );
            EventHandlerError::ThreadMessage(error.to_string())
        })?;

        match outcome {
            SubmitOutcome::Started { run_id, task } => {
                debug!(
                    event_name = "relay.run.started",
                    correlation_id = %ctx.correlation_id,
                    thread_key = %thread_key,
                    run_id = %run_id,
                    "run started"
                );
                let correlation_id = ctx.correlation_id.clone();
                tokio::spawn(async move {
                    match task.await {
                        Ok(reports) => {
                            for report in reports {
                                info!(
                                    event_name = "relay.run.finished",
                                    correlation_id = %correlation_id,
                                    thread_key = %report.thread_key,
                                    run_id = %report.run_id,
                                    status = ?report.status,
                                    tool_invocations = report.tool_invocations,
                                    edits_delivered = report.edits_delivered,
                                    "run finished"
                                );
                            }
                        }
                        Err(error) => warn!(
                            event_name = "relay.run.panicked",
                            correlation_id = %correlation_id,
                            error = %error,
                            "pipeline task ended abnormally"
                        ),
                    }
                });
            }
            SubmitOutcome::Queued { position } => debug!(
                event_name = "relay.run.queued",
                correlation_id = %ctx.correlation_id,
                thread_key = %thread_key,
                position,
                "message queued behind active run"
            ),
            SubmitOutcome::Preempting { cancelled_run } => debug!(
                event_name = "relay.run.preempting",
                correlation_id = %ctx.correlation_id,
                thread_key = %thread_key,
                run_id = %cancelled_run,
                "active run cancelled for newer message"
            ),
            SubmitOutcome::Refused { category, .. } => info!(
                event_name = "relay.message.refused",
                correlation_id = %ctx.correlation_id,
                thread_key = %thread_key,
                category = category.as_str(),
                "message refused"
            ),
            SubmitOutcome::Ignored(reason) => debug!(
                event_name = "relay.message.ignored",
                correlation_id = %ctx.correlation_id,
                thread_key = %thread_key,
                reason = ?reason,
                "message ignored"
            ),
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use threadline_agent::guardrails::GuardrailChain;
    use threadline_agent::llm::NoopLanguageModel;
    use threadline_agent::registry::ProviderRegistry;
    use threadline_agent::runtime::ConversationPipeline;
    use threadline_core::config::{GuardrailsConfig, PipelineConfig};
    use threadline_core::domain::event::InboundEvent;
    use threadline_core::domain::thread::ThreadKey;
    use threadline_core::platform::{ChatPlatform, MessageId, PlatformError};
    use threadline_mcp::McpConnector;
    use threadline_slack::{EventContext, ThreadMessageService};

    use super::RelayService;

    #[derive(Default)]
    pub(crate) struct RecordingPlatform {
        pub(crate) texts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatPlatform for RecordingPlatform {
        async fn create_message(
            &self,
            _thread: &ThreadKey,
            text: &str,
        ) -> Result<MessageId, PlatformError> {
            let mut texts = self.texts.lock().expect("texts lock");
            texts.push(text.to_string());
            Ok(MessageId(format!("m{}", texts.len())))
        }

        async fn edit_message(
            &self,
            _thread: &ThreadKey,
            _message: &MessageId,
            text: &str,
        ) -> Result<(), PlatformError> {
            self.texts.lock().expect("texts lock").push(text.to_string());
            Ok(())
        }
    }

    pub(crate) fn pipeline(platform: Arc<RecordingPlatform>) -> Arc<ConversationPipeline> {
        let registry = Arc::new(ProviderRegistry::new(
            Arc::new(McpConnector::new(&[])),
            Duration::from_secs(60),
        ));
        let guardrails =
            Arc::new(GuardrailChain::new(&GuardrailsConfig::default()).expect("guardrails"));
        Arc::new(ConversationPipeline::new(
            PipelineConfig::default(),
            guardrails,
            registry,
            Arc::new(NoopLanguageModel),
            platform,
            Some("U0BOT".to_string()),
        ))
    }

    #[tokio::test]
    async fn relays_messages_into_the_pipeline() {
        let platform = Arc::new(RecordingPlatform::default());
        let relay = RelayService::new(pipeline(Arc::clone(&platform)));

        relay
            .handle_thread_message(
                InboundEvent::new("Ev1", ThreadKey::new("C1", "1.0"), "U1", "hello"),
                &EventContext::default(),
            )
            .await
            .expect("relay");

        let delivered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = platform
                    .texts
                    .lock()
                    .expect("texts lock")
                    .iter()
                    .any(|text| text.contains("received: hello"));
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(delivered.is_ok(), "reply never reached the platform");
    }

    #[tokio::test]
    async fn own_messages_are_accepted_without_a_run() {
        let platform = Arc::new(RecordingPlatform::default());
        let pipeline = pipeline(Arc::clone(&platform));
        let relay = RelayService::new(Arc::clone(&pipeline));

        relay
            .handle_thread_message(
                InboundEvent::new("Ev2", ThreadKey::new("C1", "1.0"), "U0BOT", "echo"),
                &EventContext::default(),
            )
            .await
            .expect("relay");

        assert_eq!(pipeline.health().await.threads, 0);
        assert!(platform.texts.lock().expect("texts lock").is_empty());
    }
}

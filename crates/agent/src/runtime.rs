use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use threadline_core::config::PipelineConfig;
use threadline_core::domain::event::InboundEvent;
use threadline_core::domain::run::{RunId, RunReport, RunStatus};
use threadline_core::domain::thread::{HistoryEntry, ThreadKey};
use threadline_core::domain::tool::ProviderKey;
use threadline_core::errors::{ApplicationError, DomainError};
use threadline_core::platform::ChatPlatform;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conversation::{ContextError, ConversationStore, RunAdmission, RunHandle, RunOutcome};
use crate::guardrails::{Direction, GuardStep, GuardrailCategory, GuardrailChain, StreamingGuard};
use crate::llm::{GenerationError, GenerationEvent, GenerationSession, LanguageModel};
use crate::registry::{ProviderRegistry, ProviderStats};
use crate::streaming::{StreamEnd, StreamHandle, StreamSettings, StreamingCoordinator};
use crate::tools::{RunContext, ToolOrchestrator};

pub const NO_RESPONSE_TEXT: &str = "No response generated.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    Duplicate,
    OwnMessage,
    Empty,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Ignored(IgnoreReason),
    /// Inbound guardrail block. The refusal was posted and history is
    /// untouched.
    Refused { category: GuardrailCategory, report: RunReport },
    /// A pipeline task now owns the thread. It resolves to every run it
    /// executed, including runs for events queued behind the first.
    Started { run_id: RunId, task: JoinHandle<Vec<RunReport>> },
    Queued { position: usize },
    Preempting { cancelled_run: RunId },
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineHealth {
    pub threads: usize,
    pub active_runs: usize,
    pub available_run_permits: usize,
    pub provider_connections: usize,
    pub providers: BTreeMap<ProviderKey, ProviderStats>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub cancelled_runs: usize,
    pub closed_connections: usize,
}

/// Bounded set of recently seen event ids, oldest forgotten first.
#[derive(Debug)]
struct RecentEvents {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentEvents {
    fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), order: VecDeque::new(), seen: HashSet::new() }
    }

    /// Returns false when the id was already recorded.
    fn record(&mut self, event_id: &str) -> bool {
        if self.seen.contains(event_id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(event_id.to_string());
        self.seen.insert(event_id.to_string());
        true
    }
}

struct RunExecution {
    status: RunStatus,
    outcome: RunOutcome,
    visible_text: String,
    tool_invocations: usize,
    edits_delivered: u64,
}

/// Wires the context store, guardrails, tool orchestrator and streaming
/// coordinator around generation runs. One task drives each busy thread.
pub struct ConversationPipeline {
    config: PipelineConfig,
    store: Arc<ConversationStore>,
    guardrails: Arc<GuardrailChain>,
    tools: Arc<ToolOrchestrator>,
    model: Arc<dyn LanguageModel>,
    platform: Arc<dyn ChatPlatform>,
    streaming: StreamingCoordinator,
    run_permits: Arc<Semaphore>,
    recent_events: Mutex<RecentEvents>,
    bot_user_id: Option<String>,
}

impl ConversationPipeline {
    pub fn new(
        config: PipelineConfig,
        guardrails: Arc<GuardrailChain>,
        registry: Arc<ProviderRegistry>,
        model: Arc<dyn LanguageModel>,
        platform: Arc<dyn ChatPlatform>,
        bot_user_id: Option<String>,
    ) -> Self {
        let streaming = StreamingCoordinator::new(platform.clone(), StreamSettings::from(&config));
        Self {
            store: Arc::new(ConversationStore::new(config.run_collision_policy)),
            tools: Arc::new(ToolOrchestrator::new(registry, &config)),
            run_permits: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            recent_events: Mutex::new(RecentEvents::new(config.dedupe_capacity)),
            config,
            guardrails,
            model,
            platform,
            streaming,
            bot_user_id,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        self.tools.registry()
    }

    pub async fn submit(
        self: &Arc<Self>,
        mut event: InboundEvent,
    ) -> Result<SubmitOutcome, ApplicationError> {
        if self.bot_user_id.as_deref() == Some(event.author.as_str()) {
            debug!(event_name = "pipeline.event.ignored", reason = "own_message", "own message ignored");
            return Ok(SubmitOutcome::Ignored(IgnoreReason::OwnMessage));
        }
        if event.text.trim().is_empty() && event.attachments.is_empty() {
            return Ok(SubmitOutcome::Ignored(IgnoreReason::Empty));
        }
        if !event.event_id.is_empty() && !self.recent_events.lock().await.record(&event.event_id) {
            debug!(
                event_name = "pipeline.event.ignored",
                thread_key = %event.thread_key,
                event_id = %event.event_id,
                reason = "duplicate",
                "duplicate event ignored"
            );
            return Ok(SubmitOutcome::Ignored(IgnoreReason::Duplicate));
        }

        let verdict = self.guardrails.evaluate(&event.text, Direction::Inbound);
        if !verdict.allowed {
            let category = verdict.category.unwrap_or(GuardrailCategory::SexualAdult);
            let report = self.refuse(&event, category).await;
            return Ok(SubmitOutcome::Refused { category, report });
        }
        if let Some(rewritten) = verdict.rewritten_text {
            debug!(
                event_name = "pipeline.event.redacted",
                thread_key = %event.thread_key,
                "personal data masked before entering history"
            );
            event.text = rewritten;
        }

        match self.store.begin_run(event).await.map_err(context_failure)? {
            RunAdmission::Started(handle) => {
                let run_id = handle.run_id.clone();
                let pipeline = Arc::clone(self);
                let task = tokio::spawn(async move { pipeline.drive(handle).await });
                Ok(SubmitOutcome::Started { run_id, task })
            }
            RunAdmission::Queued { position } => Ok(SubmitOutcome::Queued { position }),
            RunAdmission::Preempting { cancelled_run } => {
                Ok(SubmitOutcome::Preempting { cancelled_run })
            }
        }
    }

    pub async fn cancel(&self, thread_key: &ThreadKey) -> Result<bool, ApplicationError> {
        self.store.cancel(thread_key).await.map_err(context_failure)
    }

    pub async fn health(&self) -> PipelineHealth {
        let registry = self.tools.registry();
        PipelineHealth {
            threads: self.store.thread_count().await,
            active_runs: self.store.active_run_count().await,
            available_run_permits: self.run_permits.available_permits(),
            provider_connections: registry.connection_count().await,
            providers: registry.stats().await,
        }
    }

    /// Periodically drops idle threads until `shutdown` fires.
    pub fn spawn_thread_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted =
                            pipeline.store.evict_idle(pipeline.config.thread_idle_eviction()).await;
                        if evicted > 0 {
                            info!(
                                event_name = "pipeline.threads.evicted",
                                evicted,
                                "idle threads evicted"
                            );
                        }
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) -> ShutdownSummary {
        let cancelled_runs = self.store.cancel_all().await;
        self.run_permits.close();
        let closed_connections = self.tools.registry().drain().await;
        info!(
            event_name = "pipeline.shutdown",
            cancelled_runs,
            closed_connections,
            "pipeline stopped"
        );
        ShutdownSummary { cancelled_runs, closed_connections }
    }

    async fn refuse(&self, event: &InboundEvent, category: GuardrailCategory) -> RunReport {
        let started_at = Utc::now();
        let refusal = category.refusal_message();
        info!(
            event_name = "pipeline.inbound.refused",
            thread_key = %event.thread_key,
            category = category.as_str(),
            "inbound message blocked by guardrail"
        );

        let edits_delivered = match self.platform.create_message(&event.thread_key, refusal).await {
            Ok(_) => 1,
            Err(error) => {
                warn!(
                    event_name = "pipeline.inbound.refusal_lost",
                    thread_key = %event.thread_key,
                    error = %error,
                    "refusal message could not be posted"
                );
                0
            }
        };

        RunReport {
            run_id: RunId::generate(),
            thread_key: event.thread_key.clone(),
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::Refused,
            final_text: refusal.to_string(),
            tool_invocations: 0,
            edits_delivered,
        }
    }

    /// Runs the admitted handle, then whatever the store starts next for the
    /// same thread, until the thread settles idle.
    async fn drive(self: Arc<Self>, first: RunHandle) -> Vec<RunReport> {
        let mut reports = Vec::new();
        let mut next = Some(first);

        while let Some(handle) = next {
            let execution = self.execute(&handle).await;
            reports.push(RunReport {
                run_id: handle.run_id.clone(),
                thread_key: handle.thread_key.clone(),
                started_at: handle.started_at,
                finished_at: Utc::now(),
                status: execution.status,
                final_text: execution.visible_text,
                tool_invocations: execution.tool_invocations,
                edits_delivered: execution.edits_delivered,
            });
            info!(
                event_name = "pipeline.run.finished",
                thread_key = %handle.thread_key,
                run_id = %handle.run_id,
                status = execution.status.as_str(),
                tool_invocations = execution.tool_invocations,
                edits_delivered = execution.edits_delivered,
                "run finished"
            );

            next = match self.store.end_run(&handle, execution.outcome).await {
                Ok(next) => next,
                Err(error) => {
                    warn!(
                        event_name = "pipeline.run.settle_failed",
                        thread_key = %handle.thread_key,
                        run_id = %handle.run_id,
                        error = %error,
                        "run could not be settled"
                    );
                    None
                }
            };
        }

        reports
    }

    async fn execute(&self, handle: &RunHandle) -> RunExecution {
        let permit = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => None,
            permit = self.run_permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            return RunExecution {
                status: RunStatus::Cancelled,
                outcome: RunOutcome::Cancelled,
                visible_text: String::new(),
                tool_invocations: 0,
                edits_delivered: 0,
            };
        };

        info!(
            event_name = "pipeline.run.started",
            thread_key = %handle.thread_key,
            run_id = %handle.run_id,
            history_len = handle.snapshot.len(),
            "generation run started"
        );

        let stream =
            self.streaming.start(handle.run_id.clone(), handle.thread_key.clone(), handle.cancel.clone());
        let context = RunContext {
            run_id: handle.run_id.clone(),
            thread_key: handle.thread_key.clone(),
            cancel: handle.cancel.clone(),
        };

        let tools = self.tools.available_tools().await;
        match self.model.start(&handle.snapshot, &tools).await {
            Ok(session) => self.generate(handle, &context, session, stream).await,
            Err(error) => fail(handle, stream, error, 0).await,
        }
    }

    async fn generate(
        &self,
        handle: &RunHandle,
        context: &RunContext,
        mut session: Box<dyn GenerationSession>,
        stream: StreamHandle,
    ) -> RunExecution {
        let mut guard = StreamingGuard::new(self.guardrails.clone());
        let mut released = 0;
        let mut entries = Vec::new();
        let mut tool_invocations = 0;

        loop {
            let event = tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => return cancelled(stream, tool_invocations).await,
                event = session.next_event() => event,
            };

            match event {
                None => break,
                Some(Err(error)) => return fail(handle, stream, error, tool_invocations).await,
                Some(Ok(GenerationEvent::TextDelta(delta))) => match guard.push(&delta) {
                    GuardStep::Release(text) => {
                        stream.push(&text[released..]);
                        released = text.len();
                    }
                    GuardStep::Hold => {}
                    GuardStep::Blocked(category) => {
                        return suppress(handle, stream, category, entries, tool_invocations).await;
                    }
                },
                Some(Ok(GenerationEvent::ToolCall(request))) => {
                    if handle.is_cancelled() {
                        return cancelled(stream, tool_invocations).await;
                    }
                    tool_invocations += 1;
                    entries.push(HistoryEntry::tool_call(request.clone()));
                    let result = self.tools.invoke(&request, context).await;
                    entries.push(HistoryEntry::tool_result(result.clone()));
                    if let Err(error) = session.supply_tool_result(result).await {
                        return fail(handle, stream, error, tool_invocations).await;
                    }
                }
            }
        }

        if handle.is_cancelled() {
            return cancelled(stream, tool_invocations).await;
        }

        let final_text = match guard.finish() {
            GuardStep::Blocked(category) => {
                return suppress(handle, stream, category, entries, tool_invocations).await;
            }
            GuardStep::Release(_) | GuardStep::Hold => match guard.text().trim() {
                "" => NO_RESPONSE_TEXT.to_string(),
                text => text.to_string(),
            },
        };

        let summary = stream.finish(StreamEnd::Completed(final_text.clone())).await;
        entries.push(HistoryEntry::assistant(final_text));
        RunExecution {
            status: RunStatus::Completed,
            outcome: RunOutcome::Completed { entries },
            visible_text: summary.visible_text,
            tool_invocations,
            edits_delivered: summary.edits_delivered,
        }
    }
}

fn context_failure(error: ContextError) -> ApplicationError {
    match error {
        ContextError::Transition(error) => ApplicationError::Domain(DomainError::from(error)),
        other => ApplicationError::Domain(DomainError::InvariantViolation(other.to_string())),
    }
}

async fn cancelled(stream: StreamHandle, tool_invocations: usize) -> RunExecution {
    let summary = stream.finish(StreamEnd::Cancelled).await;
    RunExecution {
        status: RunStatus::Cancelled,
        outcome: RunOutcome::Cancelled,
        visible_text: summary.visible_text,
        tool_invocations,
        edits_delivered: summary.edits_delivered,
    }
}

async fn fail(
    handle: &RunHandle,
    stream: StreamHandle,
    error: GenerationError,
    tool_invocations: usize,
) -> RunExecution {
    let reason = ApplicationError::from(error.clone()).to_string();
    warn!(
        event_name = "pipeline.run.failed",
        thread_key = %handle.thread_key,
        run_id = %handle.run_id,
        error = %reason,
        "generation run failed"
    );
    let notice = format!(":warning: Generation failed. {}", error.user_message());
    let summary = stream.finish(StreamEnd::Failed(notice)).await;
    RunExecution {
        status: RunStatus::Failed,
        outcome: RunOutcome::Failed { reason },
        visible_text: summary.visible_text,
        tool_invocations,
        edits_delivered: summary.edits_delivered,
    }
}

async fn suppress(
    handle: &RunHandle,
    stream: StreamHandle,
    category: GuardrailCategory,
    mut entries: Vec<HistoryEntry>,
    tool_invocations: usize,
) -> RunExecution {
    let refusal = category.refusal_message();
    info!(
        event_name = "pipeline.outbound.suppressed",
        thread_key = %handle.thread_key,
        run_id = %handle.run_id,
        category = category.as_str(),
        "outbound text blocked by guardrail"
    );
    let summary = stream.finish(StreamEnd::Suppressed(refusal.to_string())).await;
    entries.push(HistoryEntry::assistant(refusal));
    RunExecution {
        status: RunStatus::Refused,
        outcome: RunOutcome::Completed { entries },
        visible_text: summary.visible_text,
        tool_invocations,
        edits_delivered: summary.edits_delivered,
    }
}

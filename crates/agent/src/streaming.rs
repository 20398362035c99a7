use std::sync::Arc;
use std::time::Duration;

use threadline_core::config::PipelineConfig;
use threadline_core::domain::run::RunId;
use threadline_core::domain::thread::ThreadKey;
use threadline_core::platform::{ChatPlatform, EditKind, MessageId, PlatformError, StreamEdit};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CANCELLED_NOTICE: &str = "_Response cancelled._";

const EDIT_RETRY_BASE_MS: u64 = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    pub min_interval: Duration,
    /// Total delivery attempts per edit.
    pub edit_retry_limit: u32,
    pub max_message_chars: usize,
}

impl From<&PipelineConfig> for StreamSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            min_interval: config.edit_min_interval(),
            edit_retry_limit: config.edit_retry_limit.max(1),
            max_message_chars: config.max_message_chars.max(1),
        }
    }
}

/// How a stream ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    Completed(String),
    /// Replaces the visible text with a terminal error notice.
    Failed(String),
    Cancelled,
    /// Outbound guardrail block: the visible text becomes the refusal.
    Suppressed(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub edits_delivered: u64,
    pub edits_lost: u64,
    pub last_sequence: u64,
    pub messages: Vec<MessageId>,
    /// Text of the primary message after the final edit.
    pub visible_text: String,
}

enum StreamCommand {
    Delta(String),
    Finish(StreamEnd),
}

/// Turns a run's text deltas into rate-limited, strictly ordered platform
/// edits. Each run gets its own worker task; pushes never wait on the
/// platform.
#[derive(Clone)]
pub struct StreamingCoordinator {
    platform: Arc<dyn ChatPlatform>,
    settings: StreamSettings,
}

impl StreamingCoordinator {
    pub fn new(platform: Arc<dyn ChatPlatform>, settings: StreamSettings) -> Self {
        Self { platform, settings }
    }

    pub fn start(
        &self,
        run_id: RunId,
        thread_key: ThreadKey,
        cancel: CancellationToken,
    ) -> StreamHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = StreamWorker {
            platform: self.platform.clone(),
            settings: self.settings.clone(),
            run_id: run_id.clone(),
            thread_key,
            accumulated: String::new(),
            sent: None,
            sequence: 0,
            last_edit_at: None,
            summary: StreamSummary::default(),
        };
        let task = tokio::spawn(worker.run(receiver, cancel));
        StreamHandle { run_id, sender, task }
    }
}

pub struct StreamHandle {
    run_id: RunId,
    sender: mpsc::UnboundedSender<StreamCommand>,
    task: JoinHandle<StreamSummary>,
}

impl StreamHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn push(&self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if self.sender.send(StreamCommand::Delta(delta.to_string())).is_err() {
            debug!(
                event_name = "streaming.push.dropped",
                run_id = %self.run_id,
                "stream worker already stopped"
            );
        }
    }

    /// Flushes the terminal state and waits for the worker to stop.
    pub async fn finish(self, end: StreamEnd) -> StreamSummary {
        let _ = self.sender.send(StreamCommand::Finish(end));
        match self.task.await {
            Ok(summary) => summary,
            Err(error) => {
                warn!(
                    event_name = "streaming.worker.aborted",
                    run_id = %self.run_id,
                    error = %error,
                    "stream worker did not finish cleanly"
                );
                StreamSummary::default()
            }
        }
    }
}

struct StreamWorker {
    platform: Arc<dyn ChatPlatform>,
    settings: StreamSettings,
    run_id: RunId,
    thread_key: ThreadKey,
    accumulated: String,
    sent: Option<String>,
    sequence: u64,
    last_edit_at: Option<Instant>,
    summary: StreamSummary,
}

impl StreamWorker {
    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<StreamCommand>,
        cancel: CancellationToken,
    ) -> StreamSummary {
        loop {
            if cancel.is_cancelled() {
                self.stop_cancelled(&mut receiver).await;
                break;
            }

            let pending = self.pending_text();
            let deadline = self.next_tick();
            if let Some(text) = pending.clone() {
                if deadline <= Instant::now() {
                    self.emit(text).await;
                    continue;
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop_cancelled(&mut receiver).await;
                    break;
                }
                _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                    if let Some(text) = pending {
                        self.emit(text).await;
                    }
                }
                command = receiver.recv() => match command {
                    Some(StreamCommand::Delta(delta)) => self.accumulated.push_str(&delta),
                    Some(StreamCommand::Finish(end)) => {
                        self.finish(end).await;
                        break;
                    }
                    None => {
                        let text = self.accumulated.clone();
                        self.finish(StreamEnd::Completed(text)).await;
                        break;
                    }
                },
            }
        }

        self.summary.last_sequence = self.sequence;
        self.summary.visible_text = self.sent.clone().unwrap_or_default();
        self.summary
    }

    async fn stop_cancelled(&mut self, receiver: &mut mpsc::UnboundedReceiver<StreamCommand>) {
        self.wait_for_tick().await;
        let text = self.cancelled_text();
        self.emit(text).await;
        info!(
            event_name = "streaming.run.cancelled",
            run_id = %self.run_id,
            thread_key = %self.thread_key,
            "stream stopped after cancellation"
        );
        drain(receiver).await;
    }

    /// Intermediate text that differs from what the viewer already sees.
    fn pending_text(&self) -> Option<String> {
        if self.accumulated.is_empty() {
            return None;
        }
        let text = truncate_chars(&self.accumulated, self.settings.max_message_chars);
        match &self.sent {
            Some(sent) if *sent == text => None,
            _ => Some(text),
        }
    }

    fn next_tick(&self) -> Instant {
        match self.last_edit_at {
            Some(at) => at + self.settings.min_interval,
            None => Instant::now(),
        }
    }

    async fn wait_for_tick(&self) {
        tokio::time::sleep_until(self.next_tick()).await;
    }

    fn cancelled_text(&self) -> String {
        match self.sent.as_deref() {
            Some(sent) if !sent.is_empty() => {
                let notice = format!("\n\n{CANCELLED_NOTICE}");
                let room = self.settings.max_message_chars.saturating_sub(notice.chars().count());
                format!("{}{notice}", truncate_chars(sent, room))
            }
            _ => CANCELLED_NOTICE.to_string(),
        }
    }

    async fn finish(&mut self, end: StreamEnd) {
        let chunks = match end {
            StreamEnd::Completed(text) => split_message(&text, self.settings.max_message_chars),
            StreamEnd::Failed(notice) | StreamEnd::Suppressed(notice) => {
                vec![truncate_chars(&notice, self.settings.max_message_chars)]
            }
            StreamEnd::Cancelled => vec![self.cancelled_text()],
        };

        let mut chunks = chunks.into_iter();
        if let Some(first) = chunks.next() {
            if self.sent.as_deref() != Some(first.as_str()) {
                self.wait_for_tick().await;
                self.emit(first).await;
            }
        }
        for overflow in chunks {
            self.wait_for_tick().await;
            self.create_overflow(overflow).await;
        }
    }

    async fn emit(&mut self, text: String) {
        self.sequence += 1;
        let primary = self.summary.messages.first().cloned();
        let edit = StreamEdit {
            run_id: self.run_id.clone(),
            sequence: self.sequence,
            kind: if primary.is_some() { EditKind::Edit } else { EditKind::Create },
            text,
        };

        if let Some(created) = self.deliver(&edit, primary.as_ref()).await {
            if let Some(message) = created {
                self.summary.messages.push(message);
            }
            self.sent = Some(edit.text);
        }
    }

    async fn create_overflow(&mut self, text: String) {
        self.sequence += 1;
        let edit = StreamEdit {
            run_id: self.run_id.clone(),
            sequence: self.sequence,
            kind: EditKind::Create,
            text,
        };
        if let Some(Some(message)) = self.deliver(&edit, None).await {
            self.summary.messages.push(message);
        }
    }

    /// Sends one edit with bounded retries. `Some` on delivery, carrying the
    /// new message id for creations; `None` once the edit is given up.
    async fn deliver(
        &mut self,
        edit: &StreamEdit,
        target: Option<&MessageId>,
    ) -> Option<Option<MessageId>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.last_edit_at = Some(Instant::now());
            let outcome = match (edit.kind, target) {
                (EditKind::Edit, Some(message)) => self
                    .platform
                    .edit_message(&self.thread_key, message, &edit.text)
                    .await
                    .map(|()| None),
                _ => self.platform.create_message(&self.thread_key, &edit.text).await.map(Some),
            };

            let error = match outcome {
                Ok(created) => {
                    self.summary.edits_delivered += 1;
                    debug!(
                        event_name = "streaming.edit.delivered",
                        run_id = %edit.run_id,
                        thread_key = %self.thread_key,
                        sequence = edit.sequence,
                        kind = ?edit.kind,
                        chars = edit.text.chars().count(),
                        "stream edit delivered"
                    );
                    return Some(created);
                }
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= self.settings.edit_retry_limit {
                self.summary.edits_lost += 1;
                warn!(
                    event_name = "streaming.edit.lost",
                    run_id = %edit.run_id,
                    thread_key = %self.thread_key,
                    sequence = edit.sequence,
                    attempt,
                    error = %error,
                    "stream edit could not be delivered, generation continues"
                );
                return None;
            }

            let delay = retry_delay(&error, attempt);
            debug!(
                event_name = "streaming.edit.retry",
                run_id = %edit.run_id,
                sequence = edit.sequence,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "retrying stream edit"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

async fn drain(receiver: &mut mpsc::UnboundedReceiver<StreamCommand>) {
    while let Some(command) = receiver.recv().await {
        if matches!(command, StreamCommand::Finish(_)) {
            break;
        }
    }
}

fn retry_delay(error: &PlatformError, attempt: u32) -> Duration {
    match error {
        PlatformError::RateLimited { retry_after_ms: Some(ms) } => Duration::from_millis(*ms),
        _ => Duration::from_millis(EDIT_RETRY_BASE_MS.saturating_mul(u64::from(attempt))),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

/// Splits text into chunks of at most `max_chars` characters, preferring
/// paragraph breaks, then sentence ends, then a hard cut.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while rest.chars().count() > max_chars {
        let limit = rest.char_indices().nth(max_chars).map_or(rest.len(), |(index, _)| index);
        let window = &rest[..limit];
        let cut = paragraph_cut(window).or_else(|| sentence_cut(window)).unwrap_or(limit);

        let chunk = rest[..cut].trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        rest = rest[cut..].trim_start();
    }

    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

fn paragraph_cut(window: &str) -> Option<usize> {
    window.rfind("\n\n").filter(|index| *index > 0).map(|index| index + 2)
}

fn sentence_cut(window: &str) -> Option<usize> {
    [". ", "! ", "? ", ".\n", "!\n", "?\n", "\n"]
        .iter()
        .filter_map(|marker| window.rfind(marker).map(|index| index + marker.len()))
        .filter(|index| *index > 0)
        .max()
}

use async_trait::async_trait;
use thiserror::Error;
use threadline_core::domain::thread::HistoryEntry;
use threadline_core::domain::tool::{ToolCallRequest, ToolDescriptor, ToolResult};
use threadline_core::errors::ApplicationError;

/// One step of a generation run. Text arrives as appended fragments; a tool
/// call suspends the session until its result is supplied.
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationEvent {
    TextDelta(String),
    ToolCall(ToolCallRequest),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("language model rate limited the request")]
    RateLimited,
    #[error("language model did not respond in time")]
    Timeout,
    #[error("language model connection failed: {0}")]
    Connection(String),
    #[error("language model protocol error: {0}")]
    Protocol(String),
    #[error("generation failed: {0}")]
    Other(String),
}

impl GenerationError {
    /// Text shown in the thread when a run fails.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::RateLimited => {
                "Too many simultaneous requests right now. Please try again shortly."
            }
            Self::Timeout => "The request timed out. Try a simpler message.",
            Self::Connection(_) => "Connection problem reaching the assistant. Please try again shortly.",
            Self::Protocol(_) | Self::Other(_) => "Something went wrong while generating a response.",
        }
    }
}

impl From<GenerationError> for ApplicationError {
    fn from(value: GenerationError) -> Self {
        ApplicationError::Generation(value.to_string())
    }
}

#[async_trait]
pub trait GenerationSession: Send {
    /// Next event, or `None` once the run has produced its final answer.
    async fn next_event(&mut self) -> Option<Result<GenerationEvent, GenerationError>>;

    async fn supply_tool_result(&mut self, result: ToolResult) -> Result<(), GenerationError>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn start(
        &self,
        history: &[HistoryEntry],
        tools: &[ToolDescriptor],
    ) -> Result<Box<dyn GenerationSession>, GenerationError>;
}

/// Replies with a fixed acknowledgement. Used when no model endpoint is
/// configured.
#[derive(Clone, Debug, Default)]
pub struct NoopLanguageModel;

struct NoopSession {
    reply: Option<String>,
}

#[async_trait]
impl GenerationSession for NoopSession {
    async fn next_event(&mut self) -> Option<Result<GenerationEvent, GenerationError>> {
        self.reply.take().map(|text| Ok(GenerationEvent::TextDelta(text)))
    }

    async fn supply_tool_result(&mut self, result: ToolResult) -> Result<(), GenerationError> {
        Err(GenerationError::Protocol(format!(
            "no tool call is pending for invocation `{}`",
            result.invocation_id
        )))
    }
}

#[async_trait]
impl LanguageModel for NoopLanguageModel {
    async fn start(
        &self,
        history: &[HistoryEntry],
        _tools: &[ToolDescriptor],
    ) -> Result<Box<dyn GenerationSession>, GenerationError> {
        let last = history.iter().rev().find_map(HistoryEntry::text).unwrap_or_default();
        Ok(Box::new(NoopSession { reply: Some(format!("received: {last}")) }))
    }
}

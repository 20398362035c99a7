use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::tool::{ToolCallRequest, ToolResult};

/// Identifies one isolated conversation: a platform channel plus the thread
/// root inside it. Direct messages without a thread use the channel id as
/// the thread root.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey {
    pub channel_id: String,
    pub thread_id: String,
}

impl ThreadKey {
    pub fn new(channel_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self { channel_id: channel_id.into(), thread_id: thread_id.into() }
    }

    pub fn channel_only(channel_id: impl Into<String>) -> Self {
        let channel_id = channel_id.into();
        Self { thread_id: channel_id.clone(), channel_id }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.thread_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryContent {
    Text { text: String },
    ToolCall { request: ToolCallRequest },
    ToolResult { result: ToolResult },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub author: Option<String>,
    pub content: EntryContent,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn user(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            author: Some(author.into()),
            content: EntryContent::Text { text: text.into() },
            recorded_at: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            author: None,
            content: EntryContent::Text { text: text.into() },
            recorded_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            author: None,
            content: EntryContent::Text { text: text.into() },
            recorded_at: Utc::now(),
        }
    }

    pub fn tool_call(request: ToolCallRequest) -> Self {
        Self {
            role: Role::Assistant,
            author: None,
            content: EntryContent::ToolCall { request },
            recorded_at: Utc::now(),
        }
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self {
            role: Role::Tool,
            author: None,
            content: EntryContent::ToolResult { result },
            recorded_at: Utc::now(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            EntryContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Idle,
    Running,
    Cancelling,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadEvent {
    RunStarted,
    CancelRequested,
    RunCompleted,
    RunFailed,
    RunSettled,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ThreadTransitionError {
    #[error("invalid thread transition from {state:?} on {event:?}")]
    InvalidTransition { state: ThreadState, event: ThreadEvent },
}

/// Per-thread run lifecycle:
/// `Idle -> Running -> Idle`, `Running -> Cancelling -> Idle`,
/// `Running -> Failed -> Idle`.
pub fn transition(
    current: ThreadState,
    event: ThreadEvent,
) -> Result<ThreadState, ThreadTransitionError> {
    use ThreadEvent::{CancelRequested, RunCompleted, RunFailed, RunSettled, RunStarted};
    use ThreadState::{Cancelling, Failed, Idle, Running};

    match (current, event) {
        (Idle, RunStarted) => Ok(Running),
        (Running, CancelRequested) | (Cancelling, CancelRequested) => Ok(Cancelling),
        (Running, RunCompleted) => Ok(Idle),
        (Running, RunFailed) | (Cancelling, RunFailed) => Ok(Failed),
        (Failed, RunSettled) | (Cancelling, RunSettled) => Ok(Idle),
        (state, event) => Err(ThreadTransitionError::InvalidTransition { state, event }),
    }
}

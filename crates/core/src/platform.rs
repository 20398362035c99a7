use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::run::RunId;
use crate::domain::thread::ThreadKey;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Create,
    Edit,
}

/// One unit of visible output. `text` is always the full rendered message,
/// never a diff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEdit {
    pub run_id: RunId,
    pub sequence: u64,
    pub kind: EditKind,
    pub text: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("platform rate limited the request")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("platform transport failure: {0}")]
    Transport(String),
    #[error("platform rejected the request: {0}")]
    Rejected(String),
}

impl PlatformError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transport(_))
    }
}

/// Outbound side of the messaging platform. Implementations must tolerate a
/// repeated edit with identical text.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn create_message(
        &self,
        thread: &ThreadKey,
        text: &str,
    ) -> Result<MessageId, PlatformError>;

    async fn edit_message(
        &self,
        thread: &ThreadKey,
        message: &MessageId,
        text: &str,
    ) -> Result<(), PlatformError>;
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::tool::ProviderKey;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderCallError {
    #[error("tool call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("provider transport failure: {0}")]
    Transport(String),
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
    #[error("provider rejected the call: {0}")]
    Rejected(String),
}

impl ProviderCallError {
    /// Failures that indicate the connection itself is unusable.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("could not connect to provider `{key}`: {message}")]
pub struct ProviderConnectError {
    pub key: ProviderKey,
    pub message: String,
}

/// A live connection to one external tool provider.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    async fn list_capabilities(&self) -> Result<Vec<String>, ProviderCallError>;

    async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, ProviderCallError>;

    /// Whether overlapping calls on this session are safe.
    fn is_concurrent(&self) -> bool {
        false
    }

    async fn close(&self) {}
}

/// Opens provider sessions. Connecting is expensive, so callers are expected
/// to cache what this returns.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    fn provider_keys(&self) -> Vec<ProviderKey>;

    async fn connect(
        &self,
        key: &ProviderKey,
    ) -> Result<Arc<dyn ProviderSession>, ProviderConnectError>;
}

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvocationId(pub String);

impl InvocationId {
    pub fn generate() -> Self {
        Self(format!("call-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderKey(pub String);

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub invocation_id: InvocationId,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self { invocation_id: InvocationId::generate(), tool_name: tool_name.into(), arguments }
    }
}

/// A tool as advertised to the generation loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub provider_key: ProviderKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    UnknownTool,
    ProviderUnavailable,
    Timeout,
    Transport,
    InvalidArguments,
    Rejected,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: ToolFailureKind,
    pub message: String,
    pub attempts: u32,
}

/// Outcome of one tool invocation. Failures are values so the generation
/// loop can read them as tool-error messages and decide how to proceed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub invocation_id: InvocationId,
    pub tool_name: String,
    pub status: ToolStatus,
    pub payload: Option<Value>,
    pub failure: Option<ToolFailure>,
}

impl ToolResult {
    pub fn success(request: &ToolCallRequest, payload: Value) -> Self {
        Self {
            invocation_id: request.invocation_id.clone(),
            tool_name: request.tool_name.clone(),
            status: ToolStatus::Succeeded,
            payload: Some(payload),
            failure: None,
        }
    }

    pub fn failure(
        request: &ToolCallRequest,
        kind: ToolFailureKind,
        message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        let status =
            if kind == ToolFailureKind::Timeout { ToolStatus::TimedOut } else { ToolStatus::Failed };
        Self {
            invocation_id: request.invocation_id.clone(),
            tool_name: request.tool_name.clone(),
            status,
            payload: None,
            failure: Some(ToolFailure { kind, message: message.into(), attempts }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Succeeded
    }

    pub fn failure_kind(&self) -> Option<ToolFailureKind> {
        self.failure.as_ref().map(|failure| failure.kind)
    }
}

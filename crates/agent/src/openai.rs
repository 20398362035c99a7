//! Streaming client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! One [`GenerationSession`] spans several HTTP requests: each time the model
//! stops to call tools, the session waits until every result has been
//! supplied and then sends the continuation request with the tool messages
//! appended.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use threadline_core::config::ModelConfig;
use threadline_core::domain::thread::{EntryContent, HistoryEntry, Role};
use threadline_core::domain::tool::{InvocationId, ToolCallRequest, ToolDescriptor, ToolResult};
use tracing::{debug, warn};

use crate::llm::{GenerationError, GenerationEvent, GenerationSession, LanguageModel};

type ByteStream = BoxStream<'static, Result<Vec<u8>, reqwest::Error>>;

#[derive(Clone)]
pub struct OpenAiChatModel {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    system_prompt: Option<String>,
    idle_timeout: Duration,
}

impl OpenAiChatModel {
    pub fn from_config(http: reqwest::Client, config: &ModelConfig) -> Self {
        Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            idle_timeout: config.stream_idle_timeout(),
        }
    }

    async fn open_stream(
        &self,
        messages: &[Value],
        tools: &[Value],
    ) -> Result<ByteStream, GenerationError> {
        let mut body = json!({ "model": self.model, "messages": messages, "stream": true });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
        }

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        debug!(
            event_name = "model.request.sent",
            model = %self.model,
            message_count = messages.len(),
            tool_count = tools.len(),
            "sending chat completion request"
        );

        let response = tokio::time::timeout(self.idle_timeout, request.send())
            .await
            .map_err(|_| GenerationError::Timeout)?
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(status_to_error(status, &detail));
        }

        Ok(response.bytes_stream().map(|chunk| chunk.map(|bytes| bytes.to_vec())).boxed())
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn start(
        &self,
        history: &[HistoryEntry],
        tools: &[ToolDescriptor],
    ) -> Result<Box<dyn GenerationSession>, GenerationError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(json!({ "role": "system", "content": prompt }));
        }
        messages.extend(messages_from_history(history));
        let tools: Vec<Value> = tools.iter().map(tool_definition).collect();

        let stream = self.open_stream(&messages, &tools).await?;
        Ok(Box::new(OpenAiSession {
            model: self.clone(),
            messages,
            tools,
            stream: Some(stream),
            buffer: String::new(),
            pending: VecDeque::new(),
            turn_text: String::new(),
            partial_calls: BTreeMap::new(),
            awaiting: Vec::new(),
            continuation_due: false,
        }))
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

struct OpenAiSession {
    model: OpenAiChatModel,
    messages: Vec<Value>,
    tools: Vec<Value>,
    stream: Option<ByteStream>,
    buffer: String,
    pending: VecDeque<GenerationEvent>,
    turn_text: String,
    partial_calls: BTreeMap<usize, PartialToolCall>,
    awaiting: Vec<InvocationId>,
    continuation_due: bool,
}

enum LineOutcome {
    Continue,
    TurnFinished,
}

impl OpenAiSession {
    fn handle_line(&mut self, line: &str) -> Result<LineOutcome, GenerationError> {
        let line = line.trim();
        if line == "data: [DONE]" {
            return Ok(LineOutcome::TurnFinished);
        }
        let Some(data) = parse_sse_data(line) else {
            return Ok(LineOutcome::Continue);
        };

        let chunk: ChunkPayload = serde_json::from_str(data).map_err(|error| {
            GenerationError::Protocol(format!("unreadable stream chunk: {error}"))
        })?;
        if let Some(error) = chunk.error {
            let message = error.get("message").and_then(Value::as_str).unwrap_or("stream error");
            return Err(GenerationError::Other(message.to_string()));
        }

        let mut finished = false;
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|text| !text.is_empty()) {
                self.turn_text.push_str(&text);
                self.pending.push_back(GenerationEvent::TextDelta(text));
            }
            for delta in choice.delta.tool_calls {
                let call = self.partial_calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    call.id = Some(id);
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        call.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
            finished |= choice.finish_reason.is_some();
        }

        Ok(if finished { LineOutcome::TurnFinished } else { LineOutcome::Continue })
    }

    /// Closes the current response. Buffered tool calls become events and an
    /// assistant message so the continuation request can refer to them.
    fn finish_turn(&mut self) {
        self.stream = None;
        self.buffer.clear();

        let calls = std::mem::take(&mut self.partial_calls);
        let text = std::mem::take(&mut self.turn_text);
        if calls.is_empty() {
            return;
        }

        let mut wire_calls = Vec::with_capacity(calls.len());
        for call in calls.into_values() {
            let invocation_id = call.id.map(InvocationId).unwrap_or_else(InvocationId::generate);
            wire_calls.push(json!({
                "id": invocation_id.0,
                "type": "function",
                "function": { "name": call.name, "arguments": call.arguments },
            }));
            self.awaiting.push(invocation_id.clone());
            self.pending.push_back(GenerationEvent::ToolCall(ToolCallRequest {
                invocation_id,
                tool_name: call.name,
                arguments: parse_arguments(&call.arguments),
            }));
        }

        let content = if text.is_empty() { Value::Null } else { Value::String(text) };
        self.messages.push(json!({ "role": "assistant", "content": content, "tool_calls": wire_calls }));
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, GenerationError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        match tokio::time::timeout(self.model.idle_timeout, stream.next()).await {
            Err(_) => Err(GenerationError::Timeout),
            Ok(None) => Ok(None),
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(error))) => Err(map_request_error(error)),
        }
    }

    async fn advance(&mut self) -> Result<bool, GenerationError> {
        if self.continuation_due {
            self.continuation_due = false;
            self.stream = Some(self.model.open_stream(&self.messages, &self.tools).await?);
        }
        if self.stream.is_none() {
            return Ok(false);
        }

        match self.read_chunk().await? {
            None => {
                // Some servers close without a terminal `[DONE]` line.
                let rest = std::mem::take(&mut self.buffer);
                if !rest.trim().is_empty() {
                    self.handle_line(&rest)?;
                }
                self.finish_turn();
            }
            Some(chunk) => {
                self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(line_end) = self.buffer.find('\n') {
                    let line: String = self.buffer.drain(..=line_end).collect();
                    if let LineOutcome::TurnFinished = self.handle_line(&line)? {
                        self.finish_turn();
                        break;
                    }
                }
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl GenerationSession for OpenAiSession {
    async fn next_event(&mut self) -> Option<Result<GenerationEvent, GenerationError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if !self.awaiting.is_empty() {
                return Some(Err(GenerationError::Protocol(format!(
                    "{} tool result(s) outstanding",
                    self.awaiting.len()
                ))));
            }
            match self.advance().await {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(error) => {
                    warn!(event_name = "model.stream.failed", error = %error, "model stream failed");
                    self.stream = None;
                    return Some(Err(error));
                }
            }
        }
    }

    async fn supply_tool_result(&mut self, result: ToolResult) -> Result<(), GenerationError> {
        let Some(position) = self.awaiting.iter().position(|id| *id == result.invocation_id) else {
            return Err(GenerationError::Protocol(format!(
                "no tool call is pending for invocation `{}`",
                result.invocation_id
            )));
        };
        self.awaiting.remove(position);
        self.messages.push(json!({
            "role": "tool",
            "tool_call_id": result.invocation_id.0,
            "content": tool_result_content(&result),
        }));
        if self.awaiting.is_empty() {
            self.continuation_due = true;
        }
        Ok(())
    }
}

fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data)
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn tool_definition(tool: &ToolDescriptor) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": format!("Tool provided by `{}`.", tool.provider_key),
            "parameters": { "type": "object" },
        }
    })
}

fn tool_result_content(result: &ToolResult) -> String {
    match (&result.payload, &result.failure) {
        (Some(Value::String(text)), _) => text.clone(),
        (Some(payload), _) => payload.to_string(),
        (None, Some(failure)) => json!({
            "error": failure.kind,
            "message": failure.message,
            "attempts": failure.attempts,
        })
        .to_string(),
        (None, None) => "null".to_string(),
    }
}

/// Tool call entries are replayed as assistant turns, each followed by its
/// result, which the completions API accepts as sequential tool rounds.
fn messages_from_history(history: &[HistoryEntry]) -> Vec<Value> {
    let mut messages: Vec<Value> = Vec::with_capacity(history.len());
    for entry in history {
        match &entry.content {
            EntryContent::Text { text } => {
                let role = match entry.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant | Role::Tool => "assistant",
                };
                messages.push(json!({ "role": role, "content": text }));
            }
            EntryContent::ToolCall { request } => {
                let call = json!({
                    "id": request.invocation_id.0,
                    "type": "function",
                    "function": {
                        "name": request.tool_name,
                        "arguments": request.arguments.to_string(),
                    },
                });
                let extends_previous = messages.last().is_some_and(|last| {
                    last["role"] == "assistant" && last.get("tool_calls").is_some()
                });
                if extends_previous {
                    if let Some(Value::Array(calls)) =
                        messages.last_mut().and_then(|last| last.get_mut("tool_calls"))
                    {
                        calls.push(call);
                    }
                } else {
                    messages.push(json!({ "role": "assistant", "content": null, "tool_calls": [call] }));
                }
            }
            EntryContent::ToolResult { result } => messages.push(json!({
                "role": "tool",
                "tool_call_id": result.invocation_id.0,
                "content": tool_result_content(result),
            })),
        }
    }
    messages
}

fn map_request_error(error: reqwest::Error) -> GenerationError {
    if error.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Connection(error.to_string())
    }
}

fn status_to_error(status: StatusCode, body: &str) -> GenerationError {
    let detail: String = body.chars().take(200).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => GenerationError::Timeout,
        status if status.is_server_error() => {
            GenerationError::Connection(format!("model endpoint returned {status}"))
        }
        status => GenerationError::Other(format!("model endpoint returned {status}: {detail}")),
    }
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

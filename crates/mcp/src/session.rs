//! One live MCP client connection, exposed as a provider session.

use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, CallToolResult, Content, ErrorCode, JsonObject};
use rmcp::service::{DynService, Peer, RoleClient, RunningService, ServiceError};
use serde_json::Value;
use threadline_core::domain::tool::ProviderKey;
use threadline_core::provider::{ProviderCallError, ProviderSession};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub type McpRunningService = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

pub struct McpSession {
    key: ProviderKey,
    peer: Peer<RoleClient>,
    service: Mutex<Option<McpRunningService>>,
    concurrent: bool,
}

impl McpSession {
    pub fn new(key: ProviderKey, service: McpRunningService, concurrent: bool) -> Self {
        let peer = service.peer().clone();
        Self { key, peer, service: Mutex::new(Some(service)), concurrent }
    }
}

#[async_trait]
impl ProviderSession for McpSession {
    async fn list_capabilities(&self) -> Result<Vec<String>, ProviderCallError> {
        let tools = match self.peer.list_all_tools().await {
            Ok(tools) => tools,
            // Servers without pagination support answer the paged form only.
            Err(ServiceError::UnexpectedResponse) => self
                .peer
                .list_tools(None)
                .await
                .map(|page| page.tools)
                .map_err(|error| map_service_error("tools/list", error))?,
            Err(error) => return Err(map_service_error("tools/list", error)),
        };

        Ok(tools.into_iter().map(|tool| tool.name.to_string()).collect())
    }

    async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        _timeout: Duration,
    ) -> Result<Value, ProviderCallError> {
        let arguments = coerce_arguments(arguments)?;
        debug!(
            event_name = "mcp.tool.call",
            provider_key = %self.key,
            tool_name,
            "calling mcp tool"
        );

        let result = self
            .peer
            .call_tool(CallToolRequestParams {
                meta: None,
                name: tool_name.to_owned().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(|error| map_service_error("tools/call", error))?;

        map_call_result(result)
    }

    fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    async fn close(&self) {
        let Some(service) = self.service.lock().await.take() else {
            return;
        };
        if let Err(error) = service.cancel().await {
            warn!(
                event_name = "mcp.connection.close_failed",
                provider_key = %self.key,
                error = %error,
                "mcp service task did not shut down cleanly"
            );
        }
    }
}

/// Tool arguments must reach the server as a JSON object. Models sometimes
/// send the object serialized as a string.
fn coerce_arguments(value: Value) -> Result<Option<JsonObject>, ProviderCallError> {
    match value {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed: Value = serde_json::from_str(trimmed).map_err(|error| {
                ProviderCallError::InvalidArguments(format!("arguments are not valid JSON: {error}"))
            })?;
            match parsed {
                Value::Object(map) => Ok(Some(map)),
                other => Err(ProviderCallError::InvalidArguments(format!(
                    "arguments must be a JSON object; got {other}"
                ))),
            }
        }
        other => Err(ProviderCallError::InvalidArguments(format!(
            "arguments must be a JSON object; got {other}"
        ))),
    }
}

fn text_content(content: &[Content]) -> Option<String> {
    let lines: Vec<String> =
        content.iter().filter_map(|item| item.as_text().map(|text| text.text.clone())).collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Structured content wins, then joined text, then the raw content list.
fn map_call_result(result: CallToolResult) -> Result<Value, ProviderCallError> {
    let text = text_content(&result.content);

    if result.is_error.unwrap_or(false) {
        let message = result
            .structured_content
            .as_ref()
            .map(Value::to_string)
            .or(text)
            .unwrap_or_else(|| "tool returned an error result".to_owned());
        return Err(ProviderCallError::Rejected(message));
    }

    if let Some(structured) = result.structured_content {
        return Ok(structured);
    }
    if let Some(text) = text {
        return Ok(Value::String(text));
    }
    Ok(Value::Array(
        result.content.iter().filter_map(|item| serde_json::to_value(item).ok()).collect(),
    ))
}

fn map_service_error(operation: &str, error: ServiceError) -> ProviderCallError {
    match error {
        ServiceError::McpError(error) if error.code == ErrorCode::INVALID_PARAMS => {
            ProviderCallError::InvalidArguments(error.message.to_string())
        }
        ServiceError::McpError(error) => ProviderCallError::Rejected(format!(
            "{operation}: error {}: {}",
            error.code.0, error.message
        )),
        ServiceError::Timeout { timeout } => ProviderCallError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        },
        ServiceError::UnexpectedResponse => {
            ProviderCallError::Rejected(format!("{operation}: unexpected response"))
        }
        other => ProviderCallError::Transport(format!("{operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use rmcp::model::ServerJsonRpcMessage;
    use rmcp::service::{serve_directly, RoleClient, RxJsonRpcMessage, ServiceExt, TxJsonRpcMessage};
    use rmcp::transport::Transport;
    use serde_json::{json, Value};
    use threadline_core::domain::tool::ProviderKey;
    use threadline_core::provider::{ProviderCallError, ProviderSession};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    use super::{coerce_arguments, McpRunningService, McpSession};

    struct ChannelTransport {
        outbound: UnboundedSender<TxJsonRpcMessage<RoleClient>>,
        inbound: UnboundedReceiver<RxJsonRpcMessage<RoleClient>>,
    }

    impl Transport<RoleClient> for ChannelTransport {
        type Error = io::Error;

        fn send(
            &mut self,
            item: TxJsonRpcMessage<RoleClient>,
        ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send + 'static {
            let tx = self.outbound.clone();
            async move {
                tx.send(item)
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
            }
        }

        async fn receive(&mut self) -> Option<RxJsonRpcMessage<RoleClient>> {
            self.inbound.recv().await
        }

        fn close(&mut self) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
            self.inbound.close();
            std::future::ready(Ok(()))
        }
    }

    /// Answers each request with `respond(method, params)`; `None` drops the
    /// connection.
    fn scripted_service(respond: fn(&str, &Value) -> Option<Value>) -> McpRunningService {
        let (outbound_tx, mut outbound_rx) = unbounded_channel::<TxJsonRpcMessage<RoleClient>>();
        let (inbound_tx, inbound_rx) = unbounded_channel::<RxJsonRpcMessage<RoleClient>>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let Ok(value) = serde_json::to_value(message) else { continue };
                let Some(method) = value.get("method").and_then(Value::as_str) else { continue };
                if value.get("id").is_none() {
                    continue;
                }
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                let Some(reply) = respond(method, &params) else { return };

                let mut envelope = json!({ "jsonrpc": "2.0", "id": value["id"].clone() });
                if reply.get("code").is_some() {
                    envelope["error"] = reply;
                } else {
                    envelope["result"] = reply;
                }
                let response: ServerJsonRpcMessage =
                    serde_json::from_value(envelope).expect("scripted response should deserialize");
                let _ = inbound_tx.send(response);
            }
        });

        let transport = ChannelTransport { outbound: outbound_tx, inbound: inbound_rx };
        serve_directly(().into_dyn(), transport, None)
    }

    fn session(respond: fn(&str, &Value) -> Option<Value>) -> McpSession {
        McpSession::new(ProviderKey("search".to_owned()), scripted_service(respond), false)
    }

    fn tools_server(method: &str, params: &Value) -> Option<Value> {
        match method {
            "tools/list" => Some(json!({
                "tools": [
                    {"name": "web_search", "inputSchema": {"type": "object", "properties": {}}},
                    {"name": "fetch_page", "inputSchema": {"type": "object", "properties": {}}}
                ]
            })),
            "tools/call" => match params["name"].as_str() {
                Some("web_search") => Some(json!({
                    "content": [{"type": "text", "text": "first"}, {"type": "text", "text": "second"}],
                    "isError": false
                })),
                Some("fetch_page") => Some(json!({
                    "content": [{"type": "text", "text": "ignored"}],
                    "structuredContent": {"status": 200},
                    "isError": false
                })),
                Some("broken") => Some(json!({
                    "content": [{"type": "text", "text": "upstream said no"}],
                    "isError": true
                })),
                _ => Some(json!({"code": -32602, "message": "unknown tool"})),
            },
            _ => Some(json!({})),
        }
    }

    fn dropping_server(_method: &str, _params: &Value) -> Option<Value> {
        None
    }

    #[tokio::test]
    async fn lists_tool_names_as_capabilities() {
        let session = session(tools_server);
        let capabilities = session.list_capabilities().await.expect("list");
        assert_eq!(capabilities, vec!["web_search", "fetch_page"]);
    }

    #[tokio::test]
    async fn call_prefers_structured_content_then_text() {
        let session = session(tools_server);
        let timeout = Duration::from_secs(5);

        let text = session.call("web_search", json!({"q": "rust"}), timeout).await.expect("call");
        let structured = session.call("fetch_page", Value::Null, timeout).await.expect("call");

        assert_eq!(text, Value::String("first\nsecond".to_owned()));
        assert_eq!(structured, json!({"status": 200}));
    }

    #[tokio::test]
    async fn tool_errors_and_invalid_params_are_not_transport_failures() {
        let session = session(tools_server);
        let timeout = Duration::from_secs(5);

        let rejected = session.call("broken", json!({}), timeout).await.expect_err("tool error");
        let invalid = session.call("missing", json!({}), timeout).await.expect_err("invalid");

        assert_eq!(rejected, ProviderCallError::Rejected("upstream said no".to_owned()));
        assert!(matches!(invalid, ProviderCallError::InvalidArguments(_)));
        assert!(!rejected.is_retryable());
    }

    #[tokio::test]
    async fn dropped_connection_is_a_transport_failure() {
        let session = session(dropping_server);
        let error = session
            .call("web_search", json!({}), Duration::from_secs(5))
            .await
            .expect_err("connection dropped");

        assert!(error.is_connection_level(), "unexpected error: {error:?}");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = session(tools_server);
        session.close().await;
        session.close().await;
    }

    #[test]
    fn string_arguments_are_parsed_into_objects() {
        let parsed = coerce_arguments(Value::String(r#"{"q":"rust"}"#.to_owned())).expect("parse");
        assert_eq!(parsed.and_then(|map| map.get("q").cloned()), Some(json!("rust")));
        assert!(coerce_arguments(json!([1, 2])).is_err());
        assert!(coerce_arguments(Value::String("  ".to_owned())).expect("empty").is_none());
    }
}

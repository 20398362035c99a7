use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventContext, EventDispatcher, SlackEnvelope, SlackEvent};

type SlackWebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport ack failed: {0}")]
    Acknowledge(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// One decoded Socket Mode frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketFrame {
    Hello,
    /// Slack asks the client to reconnect, usually ahead of a server rotation.
    Disconnect { reason: String },
    Envelope(SlackEnvelope),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: String,
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Value,
    reason: Option<String>,
}

pub fn parse_frame(text: &str) -> Result<SocketFrame, TransportError> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|error| TransportError::Receive(format!("invalid socket frame: {error}")))?;

    match raw.frame_type.as_str() {
        "hello" => Ok(SocketFrame::Hello),
        "disconnect" => {
            Ok(SocketFrame::Disconnect { reason: raw.reason.unwrap_or_else(|| "unknown".into()) })
        }
        frame_type => {
            let envelope_id = raw.envelope_id.ok_or_else(|| {
                TransportError::Receive(format!("`{frame_type}` frame without envelope id"))
            })?;
            let event = if frame_type == "events_api" {
                SlackEvent::from_events_api(&raw.payload)
                    .map_err(|error| TransportError::Receive(error.to_string()))?
            } else {
                SlackEvent::Unsupported { event_type: frame_type.to_owned() }
            };
            Ok(SocketFrame::Envelope(SlackEnvelope { envelope_id, event }))
        }
    }
}

#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    /// `None` means the server closed the stream and a fresh connection is
    /// needed.
    async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError>;
    async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Socket Mode over a WebSocket URL obtained from `apps.connections.open`.
pub struct SlackSocketTransport {
    http: reqwest::Client,
    api_base_url: String,
    app_token: SecretString,
    socket: Mutex<Option<SlackWebSocket>>,
}

#[derive(Deserialize)]
struct ConnectionsOpenResponse {
    ok: bool,
    url: Option<String>,
    error: Option<String>,
}

impl SlackSocketTransport {
    pub fn new(http: reqwest::Client, api_base_url: impl Into<String>, app_token: SecretString) -> Self {
        Self {
            http,
            api_base_url: api_base_url.into().trim_end_matches('/').to_owned(),
            app_token,
            socket: Mutex::new(None),
        }
    }

    async fn open_connection_url(&self) -> Result<String, TransportError> {
        let response = self
            .http
            .post(format!("{}/apps.connections.open", self.api_base_url))
            .bearer_auth(self.app_token.expose_secret())
            .send()
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        let body: ConnectionsOpenResponse =
            response.json().await.map_err(|error| TransportError::Connect(error.to_string()))?;

        match (body.ok, body.url) {
            (true, Some(url)) => Ok(url),
            _ => Err(TransportError::Connect(
                body.error.unwrap_or_else(|| "apps.connections.open returned no url".to_owned()),
            )),
        }
    }
}

#[async_trait]
impl SocketTransport for SlackSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let url = self.open_connection_url().await?;
        let (socket, _) =
            connect_async(url.as_str()).await.map_err(|error| TransportError::Connect(error.to_string()))?;
        *self.socket.lock().await = Some(socket);
        Ok(())
    }

    async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError> {
        let mut guard = self.socket.lock().await;
        let Some(socket) = guard.as_mut() else {
            return Err(TransportError::Receive("socket is not connected".to_owned()));
        };

        loop {
            let message = match socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(error)) => return Err(TransportError::Receive(error.to_string())),
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => match parse_frame(text.as_ref()) {
                    Ok(SocketFrame::Hello) => debug!("socket mode hello received"),
                    Ok(SocketFrame::Disconnect { reason }) => {
                        info!(reason = %reason, "socket mode server requested reconnect");
                        return Ok(None);
                    }
                    Ok(SocketFrame::Envelope(envelope)) => return Ok(Some(envelope)),
                    Err(error) => warn!(error = %error, "dropping unreadable socket mode frame"),
                },
                Message::Ping(payload) => socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|error| TransportError::Receive(error.to_string()))?,
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }

    async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError> {
        let mut guard = self.socket.lock().await;
        let Some(socket) = guard.as_mut() else {
            return Err(TransportError::Acknowledge("socket is not connected".to_owned()));
        };
        let ack = json!({ "envelope_id": envelope_id }).to_string();
        socket
            .send(Message::Text(ack.into()))
            .await
            .map_err(|error| TransportError::Acknowledge(error.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut socket) = self.socket.lock().await.take() else {
            return Ok(());
        };
        socket.close(None).await.map_err(|error| TransportError::Disconnect(error.to_string()))
    }
}

pub struct SocketModeRunner {
    transport: Arc<dyn SocketTransport>,
    dispatcher: EventDispatcher,
    reconnect_policy: ReconnectPolicy,
}

enum PumpOutcome {
    StreamClosed,
    Shutdown,
}

impl SocketModeRunner {
    pub fn new(
        transport: Arc<dyn SocketTransport>,
        dispatcher: EventDispatcher,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self { transport, dispatcher, reconnect_policy }
    }

    /// Pumps envelopes until `shutdown` fires. A closed stream reconnects
    /// straight away; consecutive transport failures back off and give up
    /// after `max_retries` without failing the process.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let mut attempt = 0_u32;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            match self.connect_and_pump(attempt, &shutdown).await {
                Ok(PumpOutcome::Shutdown) => {
                    if let Err(error) = self.transport.disconnect().await {
                        warn!(error = %error, "socket mode disconnect failed during shutdown");
                    }
                    return Ok(());
                }
                Ok(PumpOutcome::StreamClosed) => {
                    attempt = 0;
                }
                Err(transport_error) => {
                    warn!(
                        attempt,
                        max_retries = self.reconnect_policy.max_retries,
                        error = %transport_error,
                        "socket mode transport failed"
                    );

                    if attempt >= self.reconnect_policy.max_retries {
                        warn!(
                            max_retries = self.reconnect_policy.max_retries,
                            "socket mode retries exhausted; continuing process without crash"
                        );
                        return Ok(());
                    }

                    let delay = self.reconnect_policy.backoff(attempt);
                    attempt += 1;
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_pump(
        &self,
        attempt: u32,
        shutdown: &CancellationToken,
    ) -> Result<PumpOutcome, TransportError> {
        info!(attempt, "opening socket mode transport connection");
        self.transport.connect().await?;
        info!(attempt, "socket mode transport connected");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(PumpOutcome::Shutdown),
                next = self.transport.next_envelope() => next?,
            };
            let Some(envelope) = next else {
                info!(attempt, "socket mode transport stream closed");
                self.transport.disconnect().await?;
                return Ok(PumpOutcome::StreamClosed);
            };
            let thread_key = thread_key_field(&envelope);

            info!(
                event_name = "ingress.slack.envelope_received",
                envelope_id = %envelope.envelope_id,
                event_type = ?envelope.event.event_type(),
                correlation_id = %envelope.envelope_id,
                thread_key = thread_key.as_deref().unwrap_or("unknown"),
                "received slack envelope"
            );

            // Slack redelivers anything not acknowledged within three seconds,
            // so ack before handing the event to the pipeline.
            if let Err(error) = self.transport.acknowledge(&envelope.envelope_id).await {
                warn!(
                    event_name = "ingress.slack.ack_failed",
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    thread_key = thread_key.as_deref().unwrap_or("unknown"),
                    error = %error,
                    "failed to acknowledge slack envelope"
                );
            } else {
                debug!(
                    event_name = "ingress.slack.ack_sent",
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    thread_key = thread_key.as_deref().unwrap_or("unknown"),
                    "acknowledged slack envelope"
                );
            }

            let context = EventContext { correlation_id: envelope.envelope_id.clone() };
            if let Err(error) = self.dispatcher.dispatch(&envelope, &context).await {
                warn!(
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    thread_key = thread_key.as_deref().unwrap_or("unknown"),
                    error = %error,
                    "event dispatch failed; continuing socket loop"
                );
            }
        }
    }
}

fn thread_key_field(envelope: &SlackEnvelope) -> Option<String> {
    match &envelope.event {
        SlackEvent::Message(event) | SlackEvent::AppMention(event) => {
            Some(event.thread_key().to_string())
        }
        SlackEvent::Unsupported { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::{
        parse_frame, ReconnectPolicy, SocketFrame, SocketModeRunner, SocketTransport,
        TransportError,
    };
    use crate::events::{EventDispatcher, SlackEnvelope, SlackEvent, ThreadMessageEvent};

    /// Replays a fixed script; once the envelopes run out it fires the
    /// shutdown token so the runner returns.
    struct ScriptedTransport {
        state: Mutex<ScriptedState>,
        shutdown: CancellationToken,
    }

    #[derive(Default)]
    struct ScriptedState {
        connect_results: VecDeque<Result<(), TransportError>>,
        envelopes: VecDeque<Result<Option<SlackEnvelope>, TransportError>>,
        connect_attempts: usize,
        acknowledgements: Vec<String>,
        disconnect_calls: usize,
    }

    impl ScriptedTransport {
        fn with_script(
            connect_results: Vec<Result<(), TransportError>>,
            envelopes: Vec<Result<Option<SlackEnvelope>, TransportError>>,
            shutdown: CancellationToken,
        ) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    connect_results: connect_results.into(),
                    envelopes: envelopes.into(),
                    ..ScriptedState::default()
                }),
                shutdown,
            }
        }

        async fn connect_attempts(&self) -> usize {
            self.state.lock().await.connect_attempts
        }

        async fn acknowledgements(&self) -> Vec<String> {
            self.state.lock().await.acknowledgements.clone()
        }

        async fn disconnect_calls(&self) -> usize {
            self.state.lock().await.disconnect_calls
        }
    }

    #[async_trait]
    impl SocketTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.connect_attempts += 1;
            state.connect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn next_envelope(&self) -> Result<Option<SlackEnvelope>, TransportError> {
            let mut state = self.state.lock().await;
            match state.envelopes.pop_front() {
                Some(next) => next,
                None => {
                    self.shutdown.cancel();
                    std::future::pending::<()>().await;
                    Ok(None)
                }
            }
        }

        async fn acknowledge(&self, envelope_id: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.acknowledgements.push(envelope_id.to_owned());
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.disconnect_calls += 1;
            Ok(())
        }
    }

    fn unsupported(envelope_id: &str) -> SlackEnvelope {
        SlackEnvelope {
            envelope_id: envelope_id.to_owned(),
            event: SlackEvent::Unsupported { event_type: "test".to_owned() },
        }
    }

    fn no_delay() -> ReconnectPolicy {
        ReconnectPolicy { max_retries: 2, base_delay_ms: 0, max_delay_ms: 0 }
    }

    #[tokio::test]
    async fn reconnects_after_initial_connect_failure() {
        let shutdown = CancellationToken::new();
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Err(TransportError::Connect("network down".to_owned())), Ok(())],
            vec![Ok(Some(unsupported("env-1")))],
            shutdown.clone(),
        ));

        let runner = SocketModeRunner::new(transport.clone(), EventDispatcher::default(), no_delay());
        runner.start(shutdown).await.expect("runner should not fail");

        assert_eq!(transport.connect_attempts().await, 2);
        assert_eq!(transport.acknowledgements().await, vec!["env-1"]);
    }

    #[tokio::test]
    async fn closed_stream_reconnects_and_keeps_pumping() {
        let shutdown = CancellationToken::new();
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![],
            vec![Ok(Some(unsupported("env-1"))), Ok(None), Ok(Some(unsupported("env-2")))],
            shutdown.clone(),
        ));

        let runner = SocketModeRunner::new(transport.clone(), EventDispatcher::default(), no_delay());
        runner.start(shutdown).await.expect("runner should not fail");

        assert_eq!(transport.connect_attempts().await, 2);
        assert_eq!(transport.acknowledgements().await, vec!["env-1", "env-2"]);
        // once for the closed stream, once on shutdown
        assert_eq!(transport.disconnect_calls().await, 2);
    }

    #[tokio::test]
    async fn exhausts_retries_without_crashing() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Err(TransportError::Connect("fail-2".to_owned())),
                Err(TransportError::Connect("fail-3".to_owned())),
            ],
            vec![],
            CancellationToken::new(),
        ));

        let runner = SocketModeRunner::new(transport.clone(), EventDispatcher::default(), no_delay());

        runner.start(CancellationToken::new()).await.expect("runner should degrade gracefully");
        assert_eq!(transport.connect_attempts().await, 3);
    }

    #[test]
    fn parses_control_and_event_frames() {
        assert_eq!(parse_frame(r#"{"type":"hello","num_connections":1}"#), Ok(SocketFrame::Hello));
        assert_eq!(
            parse_frame(r#"{"type":"disconnect","reason":"refresh_requested"}"#),
            Ok(SocketFrame::Disconnect { reason: "refresh_requested".to_owned() })
        );

        let frame = parse_frame(
            r#"{"type":"events_api","envelope_id":"env-9","payload":{"event_id":"Ev9",
                "event":{"type":"message","channel":"D1","channel_type":"im","user":"U1",
                "text":"hi","ts":"1730000000.1000"}}}"#,
        )
        .expect("frame");
        let SocketFrame::Envelope(envelope) = frame else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.envelope_id, "env-9");
        assert!(matches!(
            envelope.event,
            SlackEvent::Message(ThreadMessageEvent { ref text, .. }) if text == "hi"
        ));
    }

    #[test]
    fn interactive_frames_are_acknowledged_but_unsupported() {
        let frame =
            parse_frame(r#"{"type":"slash_commands","envelope_id":"env-3","payload":{}}"#).expect("frame");
        assert_eq!(
            frame,
            SocketFrame::Envelope(SlackEnvelope {
                envelope_id: "env-3".to_owned(),
                event: SlackEvent::Unsupported { event_type: "slash_commands".to_owned() },
            })
        );
        assert!(parse_frame(r#"{"type":"events_api"}"#).is_err());
    }

    #[test]
    fn backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(0).as_millis(), 250);
        assert_eq!(policy.backoff(10).as_millis(), 5_000);
    }
}

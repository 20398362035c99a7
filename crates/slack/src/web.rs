use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use threadline_core::config::SlackConfig;
use threadline_core::domain::thread::ThreadKey;
use threadline_core::platform::{ChatPlatform, MessageId, PlatformError};
use tracing::debug;

use crate::format::to_mrkdwn;

/// Outbound Slack Web API calls used to stream replies into a thread.
pub struct SlackWebClient {
    http: reqwest::Client,
    api_base_url: String,
    bot_token: SecretString,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    error: Option<String>,
    ts: Option<String>,
}

impl SlackWebClient {
    pub fn new(http: reqwest::Client, api_base_url: impl Into<String>, bot_token: SecretString) -> Self {
        Self { http, api_base_url: api_base_url.into().trim_end_matches('/').to_owned(), bot_token }
    }

    pub fn from_config(http: reqwest::Client, config: &SlackConfig) -> Self {
        Self::new(http, config.api_base_url.clone(), config.bot_token.clone())
    }

    async fn call(&self, method: &str, body: Value) -> Result<ApiResponse, PlatformError> {
        let response = self
            .http
            .post(format!("{}/{method}", self.api_base_url))
            .bearer_auth(self.bot_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|error| PlatformError::Transport(error.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(|seconds| seconds.saturating_mul(1_000));
            return Err(PlatformError::RateLimited { retry_after_ms });
        }
        if status.is_server_error() {
            return Err(PlatformError::Transport(format!("{method} returned {status}")));
        }

        let body: ApiResponse =
            response.json().await.map_err(|error| PlatformError::Transport(error.to_string()))?;
        if body.ok {
            return Ok(body);
        }

        match body.error.as_deref() {
            Some("ratelimited") => Err(PlatformError::RateLimited { retry_after_ms: None }),
            Some(error) => Err(PlatformError::Rejected(format!("{method}: {error}"))),
            None => Err(PlatformError::Rejected(format!("{method}: unknown error"))),
        }
    }
}

/// Direct messages without a thread use the channel id as the thread root;
/// Slack rejects that as a `thread_ts`.
fn thread_ts(thread: &ThreadKey) -> Option<&str> {
    (thread.thread_id != thread.channel_id).then_some(thread.thread_id.as_str())
}

#[async_trait]
impl ChatPlatform for SlackWebClient {
    async fn create_message(
        &self,
        thread: &ThreadKey,
        text: &str,
    ) -> Result<MessageId, PlatformError> {
        let mut body = json!({ "channel": thread.channel_id, "text": to_mrkdwn(text) });
        if let Some(thread_ts) = thread_ts(thread) {
            body["thread_ts"] = Value::String(thread_ts.to_owned());
        }

        let response = self.call("chat.postMessage", body).await?;
        let ts = response
            .ts
            .ok_or_else(|| PlatformError::Rejected("chat.postMessage returned no ts".to_owned()))?;
        debug!(
            event_name = "egress.slack.message_created",
            thread_key = %thread,
            message_ts = %ts,
            "posted slack message"
        );
        Ok(MessageId(ts))
    }

    async fn edit_message(
        &self,
        thread: &ThreadKey,
        message: &MessageId,
        text: &str,
    ) -> Result<(), PlatformError> {
        let body = json!({ "channel": thread.channel_id, "ts": message.0, "text": to_mrkdwn(text) });
        self.call("chat.update", body).await?;
        debug!(
            event_name = "egress.slack.message_updated",
            thread_key = %thread,
            message_ts = %message,
            "updated slack message"
        );
        Ok(())
    }
}

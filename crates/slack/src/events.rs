use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use threadline_core::domain::event::{Attachment, InboundEvent};
use threadline_core::domain::thread::ThreadKey;
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlackEnvelope {
    pub envelope_id: String,
    pub event: SlackEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlackEvent {
    Message(ThreadMessageEvent),
    AppMention(ThreadMessageEvent),
    Unsupported { event_type: String },
}

impl SlackEvent {
    pub fn event_type(&self) -> SlackEventType {
        match self {
            Self::Message(_) => SlackEventType::Message,
            Self::AppMention(_) => SlackEventType::AppMention,
            Self::Unsupported { .. } => SlackEventType::Unsupported,
        }
    }

    /// Builds an event from the `payload` object of an `events_api` envelope.
    pub fn from_events_api(payload: &Value) -> Result<Self, EventHandlerError> {
        let callback: EventCallback = serde_json::from_value(payload.clone())
            .map_err(|error| EventHandlerError::Payload(error.to_string()))?;
        let event_type = callback.event.get("type").and_then(Value::as_str).unwrap_or_default();

        match event_type {
            "message" | "app_mention" => {
                let raw: RawMessageEvent = serde_json::from_value(callback.event.clone())
                    .map_err(|error| EventHandlerError::Payload(error.to_string()))?;
                let message = raw.into_event(callback.event_id);
                Ok(if event_type == "message" {
                    Self::Message(message)
                } else {
                    Self::AppMention(message)
                })
            }
            other => Ok(Self::Unsupported { event_type: other.to_owned() }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlackEventType {
    Message,
    AppMention,
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlackFile {
    pub name: String,
    pub mime_type: Option<String>,
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadMessageEvent {
    pub event_id: String,
    pub channel_id: String,
    pub channel_type: Option<String>,
    pub ts: String,
    pub thread_ts: Option<String>,
    pub user_id: Option<String>,
    pub text: String,
    pub files: Vec<SlackFile>,
    pub bot_id: Option<String>,
    pub subtype: Option<String>,
}

impl ThreadMessageEvent {
    pub fn is_direct_message(&self) -> bool {
        self.channel_type.as_deref() == Some("im")
    }

    /// Edits, deletions and other bot output arrive as message subtypes; only
    /// plain posts and file shares are conversation turns.
    pub fn is_conversational(&self) -> bool {
        self.bot_id.is_none()
            && self.user_id.is_some()
            && matches!(self.subtype.as_deref(), None | Some("file_share") | Some("thread_broadcast"))
    }

    /// A reply always lands in the thread the message started or belongs to.
    pub fn thread_key(&self) -> ThreadKey {
        ThreadKey::new(&self.channel_id, self.thread_ts.as_deref().unwrap_or(&self.ts))
    }

    pub fn to_inbound(&self, bot_user_id: Option<&str>) -> Option<InboundEvent> {
        if !self.is_conversational() {
            return None;
        }
        let author = self.user_id.clone()?;
        let text = strip_mentions(&self.text, bot_user_id);

        let mut event = InboundEvent::new(self.event_id.clone(), self.thread_key(), author, text);
        event.attachments = self
            .files
            .iter()
            .map(|file| Attachment {
                name: file.name.clone(),
                mime_type: file.mime_type.clone(),
                url: file.url.clone(),
            })
            .collect();
        Some(event)
    }
}

fn strip_mentions(text: &str, bot_user_id: Option<&str>) -> String {
    if let Some(bot) = bot_user_id {
        return text.replace(&format!("<@{bot}>"), "").trim().to_owned();
    }

    let trimmed = text.trim_start();
    match trimmed.strip_prefix("<@").and_then(|rest| rest.split_once('>')) {
        Some((_, rest)) => rest.trim().to_owned(),
        None => trimmed.trim_end().to_owned(),
    }
}

#[derive(Deserialize)]
struct EventCallback {
    #[serde(default)]
    event_id: String,
    event: Value,
}

#[derive(Deserialize)]
struct RawMessageEvent {
    #[serde(default)]
    channel: String,
    channel_type: Option<String>,
    #[serde(default)]
    ts: String,
    thread_ts: Option<String>,
    user: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    files: Vec<RawFile>,
    bot_id: Option<String>,
    subtype: Option<String>,
}

#[derive(Deserialize)]
struct RawFile {
    #[serde(default)]
    name: String,
    mimetype: Option<String>,
    url_private: Option<String>,
}

impl RawMessageEvent {
    fn into_event(self, event_id: String) -> ThreadMessageEvent {
        // Socket mode always carries an event id; fall back to the message
        // coordinates so dedupe still has a stable key.
        let event_id =
            if event_id.is_empty() { format!("{}_{}", self.channel, self.ts) } else { event_id };
        ThreadMessageEvent {
            event_id,
            channel_id: self.channel,
            channel_type: self.channel_type,
            ts: self.ts,
            thread_ts: self.thread_ts,
            user_id: self.user,
            text: self.text,
            files: self
                .files
                .into_iter()
                .map(|file| SlackFile {
                    name: file.name,
                    mime_type: file.mimetype,
                    url: file.url_private,
                })
                .collect(),
            bot_id: self.bot_id,
            subtype: self.subtype,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Processed,
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventHandlerError {
    #[error("malformed event payload: {0}")]
    Payload(String),
    #[error("thread message handler failure: {0}")]
    ThreadMessage(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] EventHandlerError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> SlackEventType;
    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<SlackEventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let Some(handler) = self.handlers.get(&envelope.event.event_type()) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(envelope, ctx).await.map_err(DispatchError::from)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Routes direct messages and channel mentions to the same service.
pub fn thread_dispatcher<S>(service: Arc<S>, bot_user_id: Option<String>) -> EventDispatcher
where
    S: ThreadMessageService + 'static,
{
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(ThreadMessageHandler::direct_messages(
        Arc::clone(&service),
        bot_user_id.clone(),
    ));
    dispatcher.register(ThreadMessageHandler::mentions(service, bot_user_id));
    dispatcher
}

#[async_trait]
pub trait ThreadMessageService: Send + Sync {
    async fn handle_thread_message(
        &self,
        event: InboundEvent,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError>;
}

#[async_trait]
impl<S> ThreadMessageService for Arc<S>
where
    S: ThreadMessageService + ?Sized,
{
    async fn handle_thread_message(
        &self,
        event: InboundEvent,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError> {
        (**self).handle_thread_message(event, ctx).await
    }
}

/// Handles one of the two message-bearing event types. Plain `message`
/// events are only taken from direct-message channels; in shared channels
/// the bot answers `app_mention` events, which Slack also delivers as a
/// `message` that would otherwise be processed twice.
pub struct ThreadMessageHandler<S> {
    event_type: SlackEventType,
    bot_user_id: Option<String>,
    service: S,
}

impl<S> ThreadMessageHandler<S>
where
    S: ThreadMessageService,
{
    pub fn direct_messages(service: S, bot_user_id: Option<String>) -> Self {
        Self { event_type: SlackEventType::Message, bot_user_id, service }
    }

    pub fn mentions(service: S, bot_user_id: Option<String>) -> Self {
        Self { event_type: SlackEventType::AppMention, bot_user_id, service }
    }
}

#[async_trait]
impl<S> EventHandler for ThreadMessageHandler<S>
where
    S: ThreadMessageService + 'static,
{
    fn event_type(&self) -> SlackEventType {
        self.event_type.clone()
    }

    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let message = match &envelope.event {
            SlackEvent::Message(message) if message.is_direct_message() => message,
            SlackEvent::AppMention(message) => message,
            _ => return Ok(HandlerResult::Ignored),
        };

        let Some(event) = message.to_inbound(self.bot_user_id.as_deref()) else {
            debug!(
                event_name = "ingress.slack.message_skipped",
                correlation_id = %ctx.correlation_id,
                subtype = message.subtype.as_deref().unwrap_or("none"),
                "skipping non-conversational slack message"
            );
            return Ok(HandlerResult::Ignored);
        };

        info!(
            event_name = "ingress.slack.message_accepted",
            correlation_id = %ctx.correlation_id,
            thread_key = %event.thread_key,
            event_id = %event.event_id,
            "accepted slack thread message"
        );
        self.service.handle_thread_message(event, ctx).await?;
        Ok(HandlerResult::Processed)
    }
}

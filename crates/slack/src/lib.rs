//! Slack adapter for the relay.
//!
//! - **Socket Mode** (`socket`) - WebSocket event loop with reconnection logic
//! - **Events** (`events`) - envelope parsing and routing of `message` and
//!   `app_mention` events into a [`events::ThreadMessageService`]
//! - **Web API** (`web`) - `chat.postMessage` / `chat.update` behind the
//!   [`threadline_core::platform::ChatPlatform`] trait
//! - **Formatting** (`format`) - Markdown to `mrkdwn`
//!
//! ```text
//! Slack ─ws─> SocketModeRunner ─> EventDispatcher ─> ThreadMessageService ─> pipeline
//!   ^                                                                          |
//!   └──────────────────────────── SlackWebClient <── StreamingCoordinator <────┘
//! ```

pub mod events;
pub mod format;
pub mod socket;
pub mod web;

pub use events::{thread_dispatcher, EventContext, EventHandlerError, ThreadMessageService};
pub use socket::{ReconnectPolicy, SlackSocketTransport, SocketModeRunner};
pub use web::SlackWebClient;

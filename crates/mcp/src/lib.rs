//! MCP (Model Context Protocol) tool providers.
//!
//! Each entry under `[[providers]]` in the configuration names a command that
//! starts an MCP server. [`McpConnector`] spawns it, performs the client
//! handshake and hands the registry an [`McpSession`] whose capabilities are
//! the server's tool names.

mod connector;
mod session;

pub use connector::McpConnector;
pub use session::{McpRunningService, McpSession};

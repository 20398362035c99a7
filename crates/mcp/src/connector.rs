use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{ClientInfo, ProtocolVersion};
use rmcp::service::{ClientInitializeError, ServiceExt};
use rmcp::transport::TokioChildProcess;
use threadline_core::config::ProviderConfig;
use threadline_core::domain::tool::ProviderKey;
use threadline_core::provider::{ProviderConnectError, ProviderConnector, ProviderSession};
use tokio::process::Command;
use tracing::{info, warn};

use crate::session::{McpRunningService, McpSession};

/// Spawns each configured MCP server as a child process speaking stdio.
pub struct McpConnector {
    providers: BTreeMap<ProviderKey, ProviderConfig>,
}

impl McpConnector {
    pub fn new(providers: &[ProviderConfig]) -> Self {
        Self {
            providers: providers
                .iter()
                .map(|provider| (ProviderKey(provider.key.clone()), provider.clone()))
                .collect(),
        }
    }

    async fn serve(
        &self,
        provider: &ProviderConfig,
        protocol_version: ProtocolVersion,
    ) -> Result<McpRunningService, ClientInitializeError> {
        let mut command = Command::new(&provider.command);
        command.args(&provider.args);
        let transport = TokioChildProcess::new(command).map_err(|error| {
            ClientInitializeError::transport::<TokioChildProcess>(error, "spawn stdio transport")
        })?;

        let client_info = ClientInfo { protocol_version, ..Default::default() };
        client_info.into_dyn().serve(transport).await
    }
}

/// Older servers refuse the newest protocol revision during the handshake.
fn is_protocol_mismatch(error: &ClientInitializeError) -> bool {
    match error {
        ClientInitializeError::JsonRpcError(error) => {
            let message = error.message.to_ascii_lowercase();
            message.contains("protocol") && message.contains("version")
        }
        _ => false,
    }
}

#[async_trait]
impl ProviderConnector for McpConnector {
    fn provider_keys(&self) -> Vec<ProviderKey> {
        self.providers.keys().cloned().collect()
    }

    async fn connect(
        &self,
        key: &ProviderKey,
    ) -> Result<Arc<dyn ProviderSession>, ProviderConnectError> {
        let Some(provider) = self.providers.get(key) else {
            return Err(ProviderConnectError {
                key: key.clone(),
                message: "no provider is configured under this key".to_owned(),
            });
        };

        let service = match self.serve(provider, ProtocolVersion::LATEST).await {
            Ok(service) => service,
            Err(error) if is_protocol_mismatch(&error) => {
                warn!(
                    event_name = "mcp.connection.protocol_fallback",
                    provider_key = %key,
                    error = %error,
                    "retrying mcp handshake with the 2024-11-05 protocol"
                );
                self.serve(provider, ProtocolVersion::V_2024_11_05).await.map_err(|error| {
                    ProviderConnectError { key: key.clone(), message: error.to_string() }
                })?
            }
            Err(error) => {
                return Err(ProviderConnectError { key: key.clone(), message: error.to_string() })
            }
        };

        info!(
            event_name = "mcp.connection.opened",
            provider_key = %key,
            command = %provider.command,
            "mcp server started"
        );
        Ok(Arc::new(McpSession::new(key.clone(), service, provider.concurrent)))
    }
}

#[cfg(test)]
mod tests {
    use threadline_core::config::ProviderConfig;
    use threadline_core::domain::tool::ProviderKey;
    use threadline_core::provider::ProviderConnector;

    use super::McpConnector;

    fn provider(key: &str, command: &str) -> ProviderConfig {
        ProviderConfig {
            key: key.to_owned(),
            command: command.to_owned(),
            args: Vec::new(),
            concurrent: false,
        }
    }

    #[test]
    fn lists_configured_provider_keys_in_order() {
        let connector = McpConnector::new(&[provider("search", "s"), provider("calendar", "c")]);
        assert_eq!(
            connector.provider_keys(),
            vec![ProviderKey("calendar".to_owned()), ProviderKey("search".to_owned())]
        );
    }

    #[tokio::test]
    async fn unknown_key_fails_to_connect() {
        let connector = McpConnector::new(&[provider("search", "s")]);
        let error = match connector.connect(&ProviderKey("mail".to_owned())).await {
            Ok(_) => panic!("unknown provider should not connect"),
            Err(error) => error,
        };
        assert_eq!(error.key, ProviderKey("mail".to_owned()));
    }

    #[tokio::test]
    async fn missing_executable_is_a_connect_failure() {
        let connector =
            McpConnector::new(&[provider("search", "/nonexistent/threadline-mcp-server")]);
        let result = connector.connect(&ProviderKey("search".to_owned())).await;
        assert!(result.is_err());
    }
}

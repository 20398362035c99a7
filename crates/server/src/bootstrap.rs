use std::sync::Arc;
use std::time::Duration;

use threadline_agent::guardrails::{GuardrailChain, GuardrailError};
use threadline_agent::llm::{LanguageModel, NoopLanguageModel};
use threadline_agent::openai::OpenAiChatModel;
use threadline_agent::registry::ProviderRegistry;
use threadline_agent::runtime::ConversationPipeline;
use threadline_core::config::{AppConfig, ConfigError, LoadOptions};
use threadline_mcp::McpConnector;
use threadline_slack::socket::{ReconnectPolicy, SlackSocketTransport, SocketModeRunner};
use threadline_slack::{thread_dispatcher, SlackWebClient};
use thiserror::Error;
use tracing::info;

use crate::relay::RelayService;

pub struct Application {
    pub config: AppConfig,
    pub pipeline: Arc<ConversationPipeline>,
    pub slack_runner: SocketModeRunner,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Guardrails(#[from] GuardrailError),
    #[error("http client construction failed: {0}")]
    Http(#[source] reqwest::Error),
}

pub fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config)
}

pub fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        providers = config.providers.len(),
        "starting application bootstrap"
    );

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(BootstrapError::Http)?;

    let guardrails = Arc::new(GuardrailChain::new(&config.guardrails)?);
    let connector = Arc::new(McpConnector::new(&config.providers));
    let registry = Arc::new(
        ProviderRegistry::new(connector, config.pipeline.provider_staleness())
            .with_connect_timeout(config.pipeline.provider_connect_timeout()),
    );

    let model: Arc<dyn LanguageModel> = if config.model.api_key.is_some() {
        info!(
            event_name = "system.bootstrap.model_selected",
            correlation_id = "bootstrap",
            model = %config.model.model,
            "using chat completions endpoint"
        );
        Arc::new(OpenAiChatModel::from_config(http.clone(), &config.model))
    } else {
        info!(
            event_name = "system.bootstrap.model_selected",
            correlation_id = "bootstrap",
            model = "noop",
            "no model api key configured; replies are acknowledgements only"
        );
        Arc::new(NoopLanguageModel)
    };

    let platform = Arc::new(SlackWebClient::from_config(http.clone(), &config.slack));
    let pipeline = Arc::new(ConversationPipeline::new(
        config.pipeline.clone(),
        guardrails,
        registry,
        model,
        platform,
        config.slack.bot_user_id.clone(),
    ));

    let relay = Arc::new(RelayService::new(Arc::clone(&pipeline)));
    let dispatcher = thread_dispatcher(relay, config.slack.bot_user_id.clone());
    let transport = Arc::new(SlackSocketTransport::new(
        http,
        config.slack.api_base_url.clone(),
        config.slack.app_token.clone(),
    ));
    let slack_runner = SocketModeRunner::new(transport, dispatcher, ReconnectPolicy::default());

    Ok(Application { config, pipeline, slack_runner })
}

pub mod config;
pub mod domain;
pub mod errors;
pub mod platform;
pub mod provider;

pub use config::{
    AppConfig, CollisionPolicy, GuardrailsConfig, ModelConfig, PipelineConfig, ProviderConfig,
};
pub use domain::event::{Attachment, InboundEvent};
pub use domain::run::{RunId, RunReport, RunStatus};
pub use domain::thread::{HistoryEntry, Role, ThreadKey, ThreadState};
pub use domain::tool::{
    InvocationId, ProviderKey, ToolCallRequest, ToolDescriptor, ToolFailureKind, ToolResult,
    ToolStatus,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use platform::{ChatPlatform, EditKind, MessageId, PlatformError, StreamEdit};
pub use provider::{ProviderCallError, ProviderConnectError, ProviderConnector, ProviderSession};

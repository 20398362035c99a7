//! Conversation orchestration for the relay.
//!
//! - `guardrails`: category filters for inbound and streamed outbound text
//! - `conversation`: per-thread history and the Idle/Running state machine
//! - `registry`: cached tool provider connections
//! - `tools`: tool invocation with timeout and retry
//! - `streaming`: rate-limited, ordered platform edits
//! - `openai`: streaming client for OpenAI-compatible chat endpoints
//! - `runtime`: the pipeline that wires them around one generation run

pub mod conversation;
pub mod guardrails;
pub mod llm;
pub mod openai;
pub mod registry;
pub mod runtime;
pub mod streaming;
pub mod tools;

pub use conversation::{ContextError, ConversationStore, RunAdmission, RunHandle, RunOutcome};
pub use guardrails::{Direction, GuardrailCategory, GuardrailChain, Verdict};
pub use llm::{GenerationError, GenerationEvent, GenerationSession, LanguageModel};
pub use openai::OpenAiChatModel;
pub use registry::{ProviderRegistry, ProviderStats, RegistryError};
pub use runtime::{ConversationPipeline, IgnoreReason, PipelineHealth, SubmitOutcome};
pub use streaming::{StreamEnd, StreamingCoordinator};
pub use tools::{RunContext, ToolOrchestrator};

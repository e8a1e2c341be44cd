pub mod capability;
pub mod config;
pub mod error;
pub mod paths;
pub mod sse;
pub mod types;

pub use capability::{
    load_provider_descriptors, parse_provider_descriptors, DelegatedAgentSpec, ProviderDescriptor,
    TransportSpec,
};
pub use config::{load_instructions, Config, DEFAULT_INSTRUCTIONS};
pub use error::{Error, Result};
pub use paths::Paths;
pub use sse::{SseFrame, SseParser};
pub use types::{
    ChatMessage, ConversationItem, EffortPolicy, ReasoningEffort, Role, StreamEvent,
    ToolCallRequest, ToolExchange, ToolResult, ToolStatus,
};

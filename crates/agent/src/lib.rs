pub mod cache;
pub mod delegate;
pub mod events;
pub mod runtime;

pub use cache::{instruction_hash, AgentCache, AgentInstance, AgentKey, AGENT_NAME};
pub use delegate::{DelegateRuntime, DelegatedAgentTool};
pub use events::{collect_round, normalize, RoundOutput};
pub use runtime::{EventStream, RuntimeContext, RuntimeDispatcher, TurnOverrides};

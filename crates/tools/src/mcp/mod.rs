//! Model Context Protocol providers: transports, sessions and the
//! process-wide provider lifecycle.

pub mod client;
pub mod http;
pub mod manager;
pub mod provider;
pub mod rpc;
pub mod stdio;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{McpClient, McpTool};
pub use manager::{CleanupReport, ProviderConnector, ProviderLease, ProviderManager, TransportConnector};
pub use provider::{qualified_name, ProviderHealth, ProviderTool, RunningProvider, NAME_SEPARATOR};
pub use rpc::McpTransport;

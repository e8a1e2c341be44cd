use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

/// How a capability provider is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    },
    HttpStream {
        url: String,
        headers: HashMap<String, String>,
        timeout_secs: u64,
    },
    Sse {
        url: String,
        headers: HashMap<String, String>,
        timeout_secs: u64,
    },
}

impl TransportSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportSpec::Stdio { .. } => "stdio",
            TransportSpec::HttpStream { .. } => "http_stream",
            TransportSpec::Sse { .. } => "sse",
        }
    }
}

/// A provider wrapped behind its own model and instructions, exposed to the
/// main agent as one coarse tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedAgentSpec {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub transport: TransportSpec,
    /// Total start attempts; values below one are treated as one.
    pub retry_count: u32,
    pub required: bool,
    pub startup_timeout_secs: u64,
    pub cache_tools_list: bool,
    pub delegated: Option<DelegatedAgentSpec>,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, transport: TransportSpec) -> Self {
        Self {
            name: name.into(),
            transport,
            retry_count: DEFAULT_RETRY_COUNT,
            required: false,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
            cache_tools_list: true,
            delegated: None,
        }
    }

    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(
            name,
            TransportSpec::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
                cwd: None,
            },
        )
    }

    pub fn http_stream(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            TransportSpec::HttpStream {
                url: url.into(),
                headers: HashMap::new(),
                timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            },
        )
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            TransportSpec::Sse {
                url: url.into(),
                headers: HashMap::new(),
                timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            },
        )
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_startup_timeout(mut self, secs: u64) -> Self {
        self.startup_timeout_secs = secs;
        self
    }

    pub fn with_delegated(mut self, spec: DelegatedAgentSpec) -> Self {
        self.delegated = Some(spec);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.retry_count.max(1)
    }
}

// ---------------------------------------------------------------------------
// mcp_servers.json
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpConfigFile {
    #[serde(default)]
    mcp_servers: Option<BTreeMap<String, ServerEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerEntry {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default, alias = "url")]
    http_url: Option<String>,
    #[serde(default, rename = "type")]
    server_type: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default, alias = "max_retry_attempts", alias = "maxRetryAttempts")]
    retry_count: Option<u32>,
    #[serde(default)]
    required: bool,
    #[serde(default, alias = "startup_timeout")]
    startup_timeout: Option<u64>,
    #[serde(default, alias = "cache_tools_list")]
    cache_tools_list: Option<bool>,
    #[serde(default, alias = "delegated_agent")]
    delegated_agent: Option<DelegatedAgentSpec>,
}

impl ServerEntry {
    fn into_descriptor(self, name: String) -> Option<ProviderDescriptor> {
        let transport = if let Some(command) = self.command {
            TransportSpec::Stdio {
                command,
                args: self.args,
                env: self.env,
                cwd: self.cwd,
            }
        } else if let Some(url) = self.http_url {
            let timeout_secs = self.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
            match self.server_type.as_deref() {
                Some("sse") => TransportSpec::Sse {
                    url,
                    headers: self.headers,
                    timeout_secs,
                },
                _ => TransportSpec::HttpStream {
                    url,
                    headers: self.headers,
                    timeout_secs,
                },
            }
        } else {
            return None;
        };

        Some(ProviderDescriptor {
            name,
            transport,
            retry_count: self.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
            required: self.required,
            startup_timeout_secs: self.startup_timeout.unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
            cache_tools_list: self.cache_tools_list.unwrap_or(true),
            delegated: self.delegated_agent,
        })
    }
}

/// Parses the `{ "mcpServers": { ... } }` document. Comments and trailing
/// commas are accepted. Entries with neither `command` nor `httpUrl` are
/// skipped.
pub fn parse_provider_descriptors(raw: &str) -> Result<Vec<ProviderDescriptor>> {
    let file: McpConfigFile =
        json5::from_str(raw).map_err(|e| Error::Config(format!("invalid MCP config: {}", e)))?;
    let servers = file
        .mcp_servers
        .ok_or_else(|| Error::Config("MCP config has no 'mcpServers' object".to_string()))?;

    let mut out = Vec::with_capacity(servers.len());
    for (name, entry) in servers {
        match entry.into_descriptor(name.clone()) {
            Some(desc) => {
                debug!(provider = %name, transport = desc.transport.kind(), "Loaded provider descriptor");
                out.push(desc);
            }
            None => warn!(provider = %name, "MCP server entry has neither command nor httpUrl, skipping"),
        }
    }
    Ok(out)
}

/// Loads descriptors from disk. A missing file means no providers.
pub fn load_provider_descriptors(path: &Path) -> Result<Vec<ProviderDescriptor>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    parse_provider_descriptors(&raw)
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;
use crate::paths::Paths;
use crate::types::{EffortPolicy, ReasoningEffort};

pub const DEFAULT_INSTRUCTIONS: &str = "As an expert assistant your primary goal is to solve user tasks, using the available tools if needed.

When using tools you must strictly follow the Thought, Action (function call), and Observation (tool result) sequence until you have a Final Answer.

Thought:
[your reasoning here]

Action:
[function call here]

Observation:
[tool result here]
... (repeat Thought, Action, Observation)

Thought:
[your reasoning here]

Final Answer:
[your final answer here]
";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Raw effort string; normalized through `effort_policy` on use.
    #[serde(default = "default_reasoning_effort")]
    pub reasoning_effort: String,
    #[serde(default)]
    pub effort_policy: EffortPolicy,
    /// Seconds allotted to one built-in tool invocation.
    #[serde(default = "default_builtin_tool_timeout")]
    pub builtin_tool_timeout: u64,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    /// Models known not to accept tool definitions.
    #[serde(default)]
    pub toolless_models: Vec<String>,
    #[serde(default)]
    pub mcp_config_path: Option<String>,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_model() -> String {
    "gpt-oss:20b".to_string()
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_api_key() -> String {
    "ollama".to_string()
}

fn default_reasoning_effort() -> String {
    "medium".to_string()
}

fn default_builtin_tool_timeout() -> u64 {
    30
}

fn default_max_tool_iterations() -> u32 {
    16
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            api_key: default_api_key(),
            reasoning_effort: default_reasoning_effort(),
            effort_policy: EffortPolicy::default(),
            builtin_tool_timeout: default_builtin_tool_timeout(),
            max_tool_iterations: default_max_tool_iterations(),
            toolless_models: Vec::new(),
            mcp_config_path: None,
            database_path: None,
            proxy: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The configured effort, normalized under the configured policy.
    pub fn effort(&self) -> Result<ReasoningEffort> {
        ReasoningEffort::parse(&self.reasoning_effort, self.effort_policy)
    }

    pub fn database_path(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| paths.database_file())
    }

    pub fn mcp_config_path(&self, paths: &Paths) -> PathBuf {
        self.mcp_config_path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| paths.mcp_config_file())
    }

    pub fn is_toolless(&self, model: &str) -> bool {
        self.toolless_models.iter().any(|m| m == model)
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Reads the instruction text, writing the default file on first use.
/// An empty or unreadable file falls back to the default text.
pub fn load_instructions(path: &Path) -> String {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::write(path, DEFAULT_INSTRUCTIONS) {
            Ok(()) => info!(path = %path.display(), "Created instructions file"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write instructions file"),
        }
        return DEFAULT_INSTRUCTIONS.to_string();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                DEFAULT_INSTRUCTIONS.to_string()
            } else {
                trimmed.to_string()
            }
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Error reading instructions");
            DEFAULT_INSTRUCTIONS.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let cfg: Config = serde_json::from_str(r#"{ "model": "qwen3:8b" }"#).unwrap();
        assert_eq!(cfg.model, "qwen3:8b");
        assert_eq!(cfg.base_url, "http://localhost:11434/v1");
        assert_eq!(cfg.builtin_tool_timeout, 30);
        assert_eq!(cfg.max_tool_iterations, 16);
        assert_eq!(cfg.effort().unwrap(), ReasoningEffort::Medium);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.toolless_models.push("gemma3:4b".to_string());
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.is_toolless("gemma3:4b"));
        assert!(!loaded.is_toolless("gpt-oss:20b"));
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"builtinToolTimeout\""));
    }

    #[test]
    fn test_strict_policy_rejects_bad_effort() {
        let cfg: Config =
            serde_json::from_str(r#"{ "reasoningEffort": "max", "effortPolicy": "strict" }"#).unwrap();
        assert!(cfg.effort().is_err());
    }

    #[test]
    fn test_load_instructions_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instructions.md");
        let text = load_instructions(&path);
        assert_eq!(text, DEFAULT_INSTRUCTIONS);
        assert!(path.exists());

        std::fs::write(&path, "  Be brief.  \n").unwrap();
        assert_eq!(load_instructions(&path), "Be brief.");

        std::fs::write(&path, "   ").unwrap();
        assert_eq!(load_instructions(&path), DEFAULT_INSTRUCTIONS);
    }
}

pub mod chat;
pub mod sessions;

use ollama_agent_core::{load_instructions, load_provider_descriptors, Config, Paths};
use ollama_agent_providers::OpenAICompatProvider;
use ollama_agent_runtime::{RuntimeContext, RuntimeDispatcher};
use ollama_agent_storage::SessionStore;
use ollama_agent_tools::ProviderManager;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) fn open_store(paths: &Paths, config: &Config) -> anyhow::Result<SessionStore> {
    let db_path = config.database_path(paths);
    Ok(SessionStore::open(&db_path)?)
}

/// Wire config, instructions, provider descriptors and storage into a
/// dispatcher. Providers are not started here; the first turn that needs
/// one starts it.
pub(crate) fn build_dispatcher(config: Config) -> anyhow::Result<RuntimeDispatcher> {
    let paths = Paths::new();
    if let Err(e) = paths.ensure_dirs() {
        warn!(path = %paths.base.display(), error = %e, "Failed to create data directory");
    }

    let store = open_store(&paths, &config)?;
    let instructions = load_instructions(&paths.instructions_file());

    let mcp_path = config.mcp_config_path(&paths);
    let descriptors = load_provider_descriptors(&mcp_path)?;
    info!(count = descriptors.len(), path = %mcp_path.display(), "Loaded provider descriptors");

    let model_client = Arc::new(OpenAICompatProvider::from_config(&config));
    let ctx = RuntimeContext::new(config, store, model_client)
        .with_providers(ProviderManager::new(), descriptors)
        .with_instructions(instructions);
    Ok(RuntimeDispatcher::new(ctx)?)
}

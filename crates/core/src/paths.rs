use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".ollama-agent"))
            .unwrap_or_else(|| PathBuf::from(".ollama-agent"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn database_file(&self) -> PathBuf {
        self.base.join("sessions.db")
    }

    pub fn mcp_config_file(&self) -> PathBuf {
        self.base.join("mcp_servers.json")
    }

    pub fn instructions_file(&self) -> PathBuf {
        self.base.join("instructions.md")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

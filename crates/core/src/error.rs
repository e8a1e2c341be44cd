use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Tool timed out: {0}")]
    ToolTimeout(String),

    #[error("Provider '{name}' failed to start: {message}")]
    ProviderStartup { name: String, message: String },

    #[error("Provider '{name}' transport error: {message}")]
    ProviderTransport { name: String, message: String },

    #[error("Model stream error: {0}")]
    ModelStream(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Snake-case name of the variant, used as the `kind` of error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration_error",
            Error::Io(_) | Error::Storage(_) => "storage_error",
            Error::Json(_) => "serialization_error",
            Error::Tool(_) => "tool_execution_error",
            Error::ToolTimeout(_) => "tool_timeout",
            Error::ProviderStartup { .. } => "provider_startup_error",
            Error::ProviderTransport { .. } => "provider_transport_error",
            Error::ModelStream(_) => "model_stream_error",
            Error::Validation(_) => "validation_error",
            Error::NotFound(_) => "not_found",
            Error::Other(_) => "error",
        }
    }

    /// Transport failures mark a running provider as failed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::ProviderTransport { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Config("x".into()).kind(), "configuration_error");
        assert_eq!(Error::Storage("x".into()).kind(), "storage_error");
        let startup = Error::ProviderStartup {
            name: "fs".into(),
            message: "boom".into(),
        };
        assert_eq!(startup.kind(), "provider_startup_error");
        assert_eq!(startup.to_string(), "Provider 'fs' failed to start: boom");
    }

    #[test]
    fn test_transport_detection() {
        let err = Error::ProviderTransport {
            name: "fs".into(),
            message: "closed".into(),
        };
        assert!(err.is_transport());
        assert!(!Error::Tool("x".into()).is_transport());
    }
}

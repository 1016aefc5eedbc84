//! Error types for the diagnostics agent

/// Errors surfaced by the agent's public API
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

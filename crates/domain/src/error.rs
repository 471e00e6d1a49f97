/// Shared error type used across all rawi crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    /// The incoming event stream violated the provider protocol
    /// (e.g. a tool result that pairs with no tool use).
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("tool already registered: {0}")]
    DuplicateTool(String),

    /// Raised by the batched translation path when the caller reports
    /// that a cooperative scheduler is already driving its thread.
    #[error("scheduler already active: {0}")]
    SchedulerActive(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

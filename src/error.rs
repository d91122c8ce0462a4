use thiserror::Error;

/// Errors raised by a remote fetch. All of them are recoverable: the mediator
/// turns them into a failed load result instead of propagating them.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network unreachable, timeout, connection reset...
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with an error payload
    #[error("service error {status}: {message}")]
    Service { status: u16, message: String },

    /// The service answered with something we could not read
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Recoverable failure carried by a failed load.
pub type LoadError = FetchError;

/// Errors from the local cache. These are not recovered by the mediator.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cached post is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown timeline kind: {0}")]
    UnknownTimeline(String),

    /// The blocking cache task panicked or was torn down with the runtime
    #[error("cache task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("page_size must be within 1..=100, got {0}")]
    PageSize(u32),
}

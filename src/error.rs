use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("http error: {0}")]
    Http(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for AiError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to persist cache: {0}")]
    Persist(String),
}

impl From<tempfile::PersistError> for CacheError {
    fn from(e: tempfile::PersistError) -> Self {
        Self::Persist(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt entry: {0}")]
    Corrupt(String),

    #[error("no entry with id {0}")]
    NotFound(i64),
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to start plugin: {0}")]
    Spawn(String),

    #[error("plugin timed out after {0} ms")]
    Timeout(u64),

    #[error("plugin exited with status {0}")]
    Exit(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("plugin panicked")]
    Panicked,

    #[error("malformed result: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        Self::Spawn(e.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

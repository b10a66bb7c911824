use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend connection failed: {0}")]
    Connection(String),
    #[error("cache entry could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache backend operation `{op}` failed: {message}")]
    Backend { op: &'static str, message: String },
    #[error("cache backend operation `{op}` timed out")]
    Timeout { op: &'static str },
}

impl CacheError {
    pub fn backend(op: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            op,
            message: message.into(),
        }
    }
}

use std::io;

/// The URL grammar failed to compile. Only ever produced at startup.
#[derive(Debug, thiserror::Error)]
#[error("URL pattern v{version} failed to compile")]
pub struct PatternError {
    pub version: u32,
    #[source]
    pub source: regex::Error,
}

/// The helper process, one of its pipes, or one of its I/O threads could not be
/// created.
#[derive(Debug, thiserror::Error)]
#[error("failed to start URL helper `{program}`")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: io::Error,
}

/// Why the helper produced no usable candidate for one URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShortenFailure {
    #[error("helper did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("helper closed its pipes")]
    Disconnected,

    #[error("helper response exceeded {limit} bytes")]
    Oversized { limit: usize },

    #[error("helper response is not valid UTF-8")]
    NotUtf8,

    #[error("helper response does not start with `{prefix}`")]
    MissingPrefix { prefix: String },

    #[error("helper is out of step after an earlier timeout")]
    Desynchronized,
}

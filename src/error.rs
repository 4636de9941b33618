use thiserror::Error;

/// Errors the facade hands back to callers. Only misuse and bad
/// configuration end up here; upstream trouble is absorbed by the cascade.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid instrument: {0:?}")]
    InvalidInstrument(String),

    #[error("invalid timeframe: {0} minutes")]
    InvalidTimeframe(f64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not start the session loop: {0}")]
    SessionLoop(#[from] std::io::Error),
}

impl From<config::ConfigError> for FeedError {
    fn from(e: config::ConfigError) -> Self {
        FeedError::Config(e.to_string())
    }
}

pub type FeedResult<T> = Result<T, FeedError>;

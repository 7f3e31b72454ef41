use thiserror::Error;

/// Umbrella error type for Chirp components.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("XMPP error: {0}")]
    Xmpp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("subscriber lagged, {0} events missed")]
    Lagged(u64),
}

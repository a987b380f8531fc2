use thiserror::Error;

/// The core engine's single error type. Transport and protocol failures are
/// logged and absorbed by the caller; nothing in this enum is meant to be
/// propagated out of the decision loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("rate limited")]
    RateLimited,
}

impl EngineError {
    pub fn transport(msg: impl Into<String>) -> Self {
        EngineError::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        EngineError::Protocol(msg.into())
    }
}

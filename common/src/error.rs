use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),
    #[error("stop not confirmed within {0} ms")]
    StopTimeout(u64),
    #[error("no saved network is reachable")]
    NoUsableNetwork,
    #[error("reconnect gave up after {0} passes")]
    Exhausted(u32),
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Failure reported by a radio driver implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure reported by a broker transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Self::Transport(err.0)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.0)
    }
}

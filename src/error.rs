use thiserror::Error;

/// Error kinds surfaced to callers, per the fabric's error handling design.
///
/// Kinds recovered internally (transient UDP loss, peer vanish, small clock
/// skew) never reach this type — they are masked by retries, dead-router
/// detection, and tolerant timestamp checks respectively.
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("malformed endpoint: {0}")]
    MalformedEndpoint(String),

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("aborted")]
    Aborted,

    #[error("remote handler fault: {0}")]
    SessionFault(String),

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("transport failure: {0}")]
    TransportFailure(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("duplicate handler registration: {0}")]
    DuplicateHandler(String),

    #[error("invalid handler signature: {0}")]
    InvalidHandler(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FabricError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        FabricError::MalformedEndpoint(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FabricError>;

impl From<bincode::error::EncodeError> for FabricError {
    fn from(e: bincode::error::EncodeError) -> Self {
        FabricError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for FabricError {
    fn from(e: bincode::error::DecodeError) -> Self {
        FabricError::Codec(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for FabricError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FabricError::Timeout("deadline elapsed".into())
    }
}

use thiserror::Error;

use crate::dom::{DomError, Handle};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("shared-memory channels are not available in this environment")]
    UnsupportedEnvironment,
    #[error("payload of {size} bytes exceeds the channel capacity of {capacity} bytes")]
    PayloadTooLarge { size: usize, capacity: usize },
    #[error("a message is already pending on the channel")]
    ChannelBusy,
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("invalid arguments for {operation}: {message}")]
    InvalidArguments { operation: String, message: String },
    #[error(transparent)]
    Dom(#[from] DomError),
    #[error("unknown sandbox kind '{0}'")]
    UnknownSandboxKind(String),
    #[error("failed to start sandbox: {0}")]
    Spawn(String),
    #[error("sandbox execution unit was terminated")]
    Terminated,
    #[error("backend was stopped before the call completed")]
    Cancelled,
    #[error("delegation through document {0} would form a cycle")]
    DelegationCycle(Handle),
    #[error("delegation depth limit of {0} reached")]
    DelegationDepthExceeded(usize),
    #[error("script error: {0}")]
    Script(String),
    #[error("failed to encode or decode message: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

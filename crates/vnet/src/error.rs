use crate::command::CommandError;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address space exhausted: {0}")]
    AddressExhausted(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("duplicate pair: {0}")]
    DuplicatePair(String),

    #[error(transparent)]
    CommandFailed(#[from] CommandError),

    #[error("process not running: {0}")]
    ProcessNotRunning(String),

    #[error("precondition missing: {0}")]
    PreconditionMissing(String),

    #[error("invalid scheme: {0}")]
    InvalidScheme(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

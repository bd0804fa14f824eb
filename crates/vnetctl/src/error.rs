#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Net(#[from] vnet::NetError),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CtlResult<T> = Result<T, CtlError>;

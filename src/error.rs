use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("dispatch already in progress")]
    AlreadyBusy,
    #[error("broker closed")]
    Closed,
    #[error("provider is read-only")]
    ReadOnlyViolation,
    #[error("provider is write-only")]
    WriteOnlyViolation,
    #[error("end of log")]
    EndOfLog,
    #[error("corrupt record: {0}")]
    CorruptRecord(&'static str),
    #[error("network unavailable: {0}")]
    NetworkUnavailable(#[source] std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

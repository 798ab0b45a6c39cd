//! Status codes shared across the write and read paths.
//!
//! The table logger and the directory logger latch the first non-OK status
//! and keep returning it from later calls, so the error type is `Clone`.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("corruption: {0}")]
    Corruption(&'static str),

    #[error("io error: {0}")]
    Io(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Non-blocking backpressure: both write buffers are busy.
    #[error("try again: write buffers are full")]
    TryAgain,

    /// A background compaction failed earlier; the directory is read-only
    /// garbage from here on.
    #[error("busy: a background error has been latched")]
    Busy,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    pub fn is_try_again(&self) -> bool {
        matches!(self, Error::TryAgain)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

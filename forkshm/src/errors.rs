use std::io;

use thiserror::Error;

use crate::worker::RemoteError;

pub type Result<T> = std::result::Result<T, ShmemError>;

#[derive(Debug, Error)]
pub enum ShmemError {
    #[error("shared memory allocation failed: {0}")]
    Allocation(#[source] io::Error),

    #[error("not enough space: requested {requested} bytes, {available} available")]
    Full { requested: usize, available: usize },

    #[error("read past unread bytes: requested {requested} bytes, {available} available")]
    OutOfRange { requested: usize, available: usize },

    #[error("no message is ready")]
    WouldBlock,

    #[error("lifecycle error: {0}")]
    Lifecycle(&'static str),

    #[error("worker failed: {0}")]
    Remote(RemoteError),

    #[error("worker exited with status {status} without reporting a result")]
    MissingResult { status: i32 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("configuration error: {0}")]
    Config(#[from] confy::ConfyError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("mutex was poisoned")]
    PoisonedLock,

    #[error("logic error: {0}")]
    Logic(String),
}

impl ShmemError {
    /// `true` when the same call may succeed later without any other change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShmemError::Full { .. } | ShmemError::WouldBlock)
    }

    // raw_sync hands back a non-Send boxed error.
    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> Self {
        ShmemError::Lock(err.to_string())
    }

    pub(crate) fn last_os_error() -> Self {
        ShmemError::Io(io::Error::last_os_error())
    }
}

impl<T> From<std::sync::PoisonError<T>> for ShmemError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        ShmemError::PoisonedLock
    }
}

impl From<postcard::Error> for ShmemError {
    fn from(err: postcard::Error) -> Self {
        ShmemError::Codec(err.to_string())
    }
}

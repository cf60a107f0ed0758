use compute_state::StateError;

/// Errors that end a watch, or prevent one from starting.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// History after this version is no longer available, or the watcher
    /// fell too far behind the change feed.
    #[error(
        "resource version {resource_version} is too old; restart from a fresh search stream and its bookmark"
    )]
    TooOldResourceVersion { resource_version: u64 },

    #[error("resource version {requested} is ahead of the current version {current}")]
    FutureResourceVersion { requested: u64, current: u64 },

    #[error("failed to encode delta: {0}")]
    Encode(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl WatchError {
    /// Stable code written into in-band stream errors.
    pub fn code(&self) -> &'static str {
        match self {
            WatchError::TooOldResourceVersion { .. } => "TooOldResourceVersion",
            WatchError::FutureResourceVersion { .. } => "InvalidArgument",
            WatchError::Encode(_) | WatchError::State(_) => "Internal",
        }
    }
}

pub type WatchResult<T> = Result<T, WatchError>;

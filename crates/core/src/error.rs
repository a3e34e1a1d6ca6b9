use std::io;

use thiserror::Error;

use crate::model::Handle;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(Handle),

    #[error("not a directory: {0}")]
    NotADirectory(Handle),

    #[error("read-only container: {0}")]
    ReadOnly(Handle),

    #[error("destination already exists: {0}")]
    AlreadyExists(String),

    #[error("i/o error on {handle}: {source}")]
    Io {
        handle: Handle,
        #[source]
        source: io::Error,
    },
}

impl ProviderError {
    pub fn io(handle: &Handle, source: io::Error) -> Self {
        Self::Io {
            handle: handle.clone(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("storage provider unavailable for {root}: {reason}")]
    ProviderUnavailable { root: Handle, reason: String },

    #[error("entry unreadable: {identifier}: {reason}")]
    EntryUnreadable { identifier: Handle, reason: String },

    #[error("destination is not a writable container: {0}")]
    DestinationInvalid(Handle),

    #[error("size mismatch: expected {expected} bytes, wrote {written}")]
    SizeMismatch { expected: u64, written: u64 },

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("scan generation {requested} is stale (current {current})")]
    StaleGeneration { requested: u64, current: u64 },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub type Result<T, E = RecoveryError> = std::result::Result<T, E>;

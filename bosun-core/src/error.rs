use bosun_model::{EntityId, EntityKind, IdError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BosunError {
    #[error("entity not found: {0}")]
    NotFound(EntityId),

    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        expected: EntityKind,
        found: EntityKind,
    },

    #[error("invalid entity id: {0}")]
    InvalidId(#[from] IdError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("process is not running: {0}")]
    NotRunning(EntityId),

    #[error("process is not stopped: {0}")]
    NotStopped(EntityId),

    #[error("operation already in progress for {0}")]
    Duplicate(EntityId),

    #[error("project is already cloned: {0}")]
    AlreadyCloned(EntityId),

    #[cfg(unix)]
    #[error("signal error: {0}")]
    Signal(#[from] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BosunError>;

use thiserror::Error;

/// Errors produced while encoding or decoding entity IDs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("entity id is not valid base64: {0}")]
    Encoding(String),

    #[error("entity id is malformed: {0}")]
    Malformed(String),

    #[error("unknown entity kind: {0}")]
    UnknownKind(String),
}

pub type Result<T> = std::result::Result<T, IdError>;

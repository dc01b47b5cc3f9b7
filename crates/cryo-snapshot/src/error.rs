use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Storage(#[from] cryo_storage::StorageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt image: {0}")]
    Corrupt(&'static str),

    #[error("{step} refused to cooperate")]
    Refused { step: &'static str },

    #[error("not enough memory or storage")]
    NoSpace,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("cycle aborted")]
    Aborted,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

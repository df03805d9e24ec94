use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),
    #[error("wal error: {0}")]
    Wal(#[from] wal::WalError),
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("hash entry does not fit in a page")]
    KeyTooLarge,
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("index corrupted: {0}")]
    Corrupted(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

impl QueryError {
    pub fn parse(offset: usize, message: impl Into<String>) -> Self {
        QueryError::Parse {
            offset,
            message: message.into(),
        }
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        QueryError::Corrupted(message.into())
    }
}

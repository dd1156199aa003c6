use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not open database: {0}")]
    DatabaseOpen(String),

    #[error("Bucket does not exist: {0}")]
    BucketNotFound(String),

    #[error("Database does not exist: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupted data: {0}")]
    Corruption(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

// Conversion for batch encoding errors
impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

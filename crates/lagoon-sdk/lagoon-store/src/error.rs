use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("connection mutex poisoned")]
    Poisoned,

    /// A domain error raised while a store transaction was open.
    #[error(transparent)]
    Sdk(#[from] lagoon_sdk::Error),
}

impl From<StoreError> for lagoon_sdk::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Sdk(e) => e,
            other => lagoon_sdk::Error::Store(other.to_string()),
        }
    }
}

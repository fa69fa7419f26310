use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Logger error: {0}")]
    Logger(String),

    #[error("Store error: {0}")]
    Store(#[from] lagoon_store::StoreError),

    #[error(transparent)]
    Sdk(#[from] lagoon_sdk::Error),
}

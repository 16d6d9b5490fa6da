use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("Blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransitionerError {
    #[error("model error: {0}")]
    Model(#[from] warden_model::ModelError),

    #[error("store error: {0}")]
    Store(#[from] warden_store::StoreError),

    #[error("lost transition lock: {0}")]
    LockLost(String),
}

use thiserror::Error;
use warden_domain::{FieldError, RecoveryConfiguration, Transition};
use warden_store::StoreError;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("invalid parameters")]
    InvalidParams(Vec<FieldError>),

    #[error("field '{0}' is immutable")]
    InvalidUpdate(String),

    #[error("action '{action}' not allowed in state '{state}'")]
    ActionNotAllowed { action: String, state: String },

    #[error("{0}")]
    PreconditionFailed(String),

    /// An unfinished transition of the same name already exists. Carries the
    /// existing rows so callers can report progress instead of a bare
    /// conflict.
    #[error("transition '{name}' already in progress")]
    TransitionAlreadyExists {
        name: String,
        transition: Box<Transition>,
        config: Box<RecoveryConfiguration>,
    },

    #[error(transparent)]
    Domain(#[from] warden_domain::DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ModelError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        ModelError::InvalidParams(vec![FieldError {
            field: field.to_string(),
            code: "InvalidParameter".to_string(),
            message: message.into(),
        }])
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid guid: {0}")]
    InvalidGuid(String),

    #[error("invalid uuid: {0}")]
    InvalidUuid(String),

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid token body: {0}")]
    InvalidTokenBody(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("action '{action}' not allowed in state '{state}'")]
    ActionNotAllowed { action: String, state: String },
}

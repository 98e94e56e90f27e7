use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("etag mismatch on {bucket}/{key}")]
    EtagMismatch { bucket: String, key: String },

    #[error("key already exists: {bucket}/{key}")]
    UniqueViolation { bucket: String, key: String },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        StoreError::NotFound { bucket: bucket.to_string(), key: key.to_string() }
    }

    pub fn etag_mismatch(bucket: &str, key: &str) -> Self {
        StoreError::EtagMismatch { bucket: bucket.to_string(), key: key.to_string() }
    }

    pub fn unique_violation(bucket: &str, key: &str) -> Self {
        StoreError::UniqueViolation { bucket: bucket.to_string(), key: key.to_string() }
    }
}

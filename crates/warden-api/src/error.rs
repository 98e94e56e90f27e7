use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::error;
use warden_domain::FieldError;
use warden_model::ModelError;
use warden_store::StoreError;

/// Structured API error: `{"code": "...", "message": "...", "errors": [...]}`
/// with optional extra top-level fields (the transition-already-exists
/// companion body).
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub errors: Vec<FieldError>,
    pub extra: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        ApiError { status, code, message: message.into(), errors: Vec::new(), extra: None }
    }

    pub fn invalid_params(errors: Vec<FieldError>) -> Self {
        let mut e = Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "InvalidParameters",
            "request validation failed",
        );
        e.errors = errors;
        e
    }

    pub fn missing_param(field: impl Into<String>) -> Self {
        let field = field.into();
        let mut e = Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "MissingParameter",
            format!("'{}' is required", field),
        );
        e.errors = vec![FieldError {
            field,
            code: "MissingParameter".to_string(),
            message: "is required".to_string(),
        }];
        e
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "ResourceNotFound", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized", message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "InvalidArgument", message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PRECONDITION_FAILED, "PreconditionFailed", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BadRequest", message)
    }

    pub fn internal(cause: impl std::fmt::Display) -> Self {
        // The cause is logged, never shown to the client.
        error!(error = %cause, "internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "code": self.code, "message": self.message });
        if !self.errors.is_empty() {
            body["errors"] = json!(self.errors);
        }
        if let Some(Value::Object(extra)) = self.extra {
            if let Value::Object(map) = &mut body {
                map.extend(extra);
            }
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<ModelError> for ApiError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::NotFound(what) => ApiError::not_found(format!("{} not found", what)),
            ModelError::MissingParameter(field) => ApiError::missing_param(field),
            ModelError::InvalidParams(errors) => ApiError::invalid_params(errors),
            ModelError::InvalidUpdate(field) => {
                ApiError::invalid_argument(format!("field '{}' is immutable", field))
            }
            ModelError::ActionNotAllowed { action, state } => ApiError::invalid_argument(format!(
                "action '{}' not allowed in state '{}'",
                action, state
            )),
            ModelError::PreconditionFailed(msg) => ApiError::precondition_failed(msg),
            ModelError::TransitionAlreadyExists { name, transition, config } => {
                let mut err = ApiError::new(
                    StatusCode::CONFLICT,
                    "TransitionAlreadyExists",
                    format!("a '{}' transition is already in progress", name),
                );
                err.extra = Some(json!({
                    "transition": crate::handlers::transition_view(&transition),
                    "config": crate::handlers::config_view(&config),
                }));
                err
            }
            ModelError::Domain(e) => ApiError::invalid_params(vec![FieldError {
                field: String::new(),
                code: "InvalidParameter".to_string(),
                message: e.to_string(),
            }]),
            ModelError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { bucket, key } => {
                ApiError::not_found(format!("{}/{} not found", bucket, key))
            }
            // A create over an existing unique key is a duplicate; an etag
            // mismatch is a retryable conflict. Both surface as 409.
            StoreError::UniqueViolation { bucket, key } => ApiError {
                status: StatusCode::CONFLICT,
                code: "Duplicate",
                message: format!("{}/{} already exists", bucket, key),
                errors: Vec::new(),
                extra: None,
            },
            StoreError::EtagMismatch { .. } => {
                ApiError::invalid_argument("concurrent modification, retry")
            }
            other => ApiError::internal(other),
        }
    }
}

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use df_core::Error as CoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<df_core::ValidationError> for ApiError {
    fn from(e: df_core::ValidationError) -> Self {
        ApiError::Core(e.into())
    }
}

fn classify(err: &CoreError) -> (StatusCode, &'static str) {
    match err {
        CoreError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        CoreError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
        CoreError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        CoreError::Transition(_) => (StatusCode::CONFLICT, "invalid_state"),
        CoreError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        CoreError::Provider { .. } => (StatusCode::BAD_GATEWAY, "provider"),
        CoreError::ProviderUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
        }
        CoreError::Persistence(_) => (StatusCode::SERVICE_UNAVAILABLE, "persistence"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation"),
            ApiError::Core(e) => classify(e),
        };

        if status.is_server_error() {
            tracing::warn!(kind, error = %self, "request failed");
        }

        let mut body = serde_json::json!({ "error": self.to_string(), "kind": kind });
        if let ApiError::Core(CoreError::Provider {
            category, record, ..
        }) = &self
        {
            body["category"] = serde_json::json!(category);
            if let Some(record) = record {
                body["record"] = serde_json::json!(record);
            }
        }
        (status, axum::Json(body)).into_response()
    }
}

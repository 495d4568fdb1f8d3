//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Mapping of service errors onto HTTP responses."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gridtel_core::{GridError, ServiceError};
use tracing::{error, warn};

/// Error rendered as `{"detail": "..."}` with a status derived from its cause.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Build an error with an explicit status.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// HTTP status this error renders with.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<GridError> for ApiError {
    fn from(err: GridError) -> Self {
        let status = match &err {
            GridError::Validation(_) => StatusCode::BAD_REQUEST,
            GridError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GridError::Service(ServiceError::NotConfigured(_)) => StatusCode::SERVICE_UNAVAILABLE,
            GridError::Service(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %err, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %err, "request rejected");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.message })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridtel_core::ValidationError;
    use gridtel_persistence::StorageError;

    #[test]
    fn status_follows_error_class() {
        let cases = [
            (GridError::from(ValidationError::NegativeCount(-1)), StatusCode::BAD_REQUEST),
            (GridError::from(StorageError::WorkerUnavailable), StatusCode::INTERNAL_SERVER_ERROR),
            (
                GridError::from(ServiceError::NotConfigured("key".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GridError::from(ServiceError::Unavailable("down".into())),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }
}

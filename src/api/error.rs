use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::errors::{CoordinatorError, ErrorKind};

/// HTTP face of [`CoordinatorError`].
#[derive(Debug)]
pub struct ApiError(pub CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::Denied | ErrorKind::InvalidTransition => {
            StatusCode::CONFLICT
        }
        ErrorKind::Validation | ErrorKind::Config => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Collaborator => StatusCode::BAD_GATEWAY,
        ErrorKind::Persistence | ErrorKind::Corruption | ErrorKind::Io => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(json!({
                "error": kind.as_str(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

//! HTTP-facing error type.
//!
//! Only the I/O attachment layer and the session controller surface errors to
//! clients; the transform supervisor reports exclusively through the result
//! store. Kinds map onto status codes the way §request semantics demand:
//! malformed parameters are the caller's fault, unknown handles are absence,
//! everything else is the service's.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced on the HTTP edge
#[derive(Debug, Error)]
pub enum PinchError {
    /// Malformed query parameter (400)
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown handle or absent fifo (404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Copy failure between an HTTP body and a fifo (500)
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else that should never reach a healthy client (500)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for handler operations
pub type Result<T> = std::result::Result<T, PinchError>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for PinchError {
    fn into_response(self) -> Response {
        let status = match &self {
            PinchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PinchError::NotFound(_) => StatusCode::NOT_FOUND,
            PinchError::Io(_) | PinchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

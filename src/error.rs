//! Error types for presenced.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client event sink closed")]
    SinkClosed,

    #[error("missing identity headers")]
    MissingIdentity,
}

impl IntoResponse for PresenceError {
    fn into_response(self) -> Response {
        let status = match &self {
            PresenceError::ChannelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PresenceError::Protocol(_) => StatusCode::BAD_REQUEST,
            PresenceError::SinkClosed => StatusCode::INTERNAL_SERVER_ERROR,
            PresenceError::MissingIdentity => StatusCode::UNAUTHORIZED,
        };
        (status, self.to_string()).into_response()
    }
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use tether_bridge::{BridgeError, MediaError, SendError, SessionError};
use tether_shared::ParseError;
use tether_store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl From<ParseError> for ApiError {
    fn from(e: ParseError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<SendError> for ApiError {
    fn from(e: SendError) -> Self {
        ApiError::Bridge(e.into())
    }
}

impl From<MediaError> for ApiError {
    fn from(e: MediaError) -> Self {
        ApiError::Bridge(e.into())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        ApiError::Bridge(e.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Bridge(e) => bridge_status(e),
        }
    }
}

fn bridge_status(e: &BridgeError) -> StatusCode {
    match e {
        BridgeError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        BridgeError::Storage(StoreError::NotFound) => StatusCode::NOT_FOUND,
        BridgeError::Storage(_) | BridgeError::Ingest(_) => StatusCode::INTERNAL_SERVER_ERROR,
        BridgeError::Session(e) => session_status(e),
        BridgeError::Send(e) => match e {
            SendError::InvalidRecipient(_) | SendError::File(_) => StatusCode::BAD_REQUEST,
            SendError::BridgeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            SendError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SendError::UnsupportedAudioFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            SendError::Transport(_) => StatusCode::BAD_GATEWAY,
            SendError::Record(_) | SendError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
        BridgeError::Media(e) => match e {
            MediaError::MessageNotFound | MediaError::NoMedia => StatusCode::NOT_FOUND,
            MediaError::Unavailable(_) => StatusCode::GONE,
            MediaError::IntegrityMismatch(_) | MediaError::Transport(_) => StatusCode::BAD_GATEWAY,
            MediaError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
            MediaError::Session(e) => session_status(e),
            MediaError::Storage(_) | MediaError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn session_status(e: &SessionError) -> StatusCode {
    match e {
        SessionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SessionError::NotPaired | SessionError::CredentialsExpired => StatusCode::CONFLICT,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request refused");
        }

        let body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_errors_map_to_statuses() {
        assert_eq!(ApiError::from(SendError::BridgeUnavailable).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::from(SendError::InvalidRecipient("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::from(MediaError::Unavailable("expired".into())).status(), StatusCode::GONE);
        assert_eq!(
            ApiError::Bridge(BridgeError::Storage(StoreError::NotFound)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::from(SessionError::NotPaired).status(), StatusCode::CONFLICT);
    }
}

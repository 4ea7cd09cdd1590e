use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::ghapp::TokenError;
use crate::models::ErrorBody;
use crate::runners::LaunchError;
use crate::signature::SignatureError;

/// Everything that can end a webhook delivery early.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Unauthorized(#[from] SignatureError),
    #[error("invalid JSON payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
    #[error("payload has no repository URL")]
    MissingRepositoryUrl,
    #[error("repository URL {0:?} is not an http(s) URL")]
    InvalidRepositoryUrl(String),
    #[error("token exchange failed: {0}")]
    TokenExchange(#[from] TokenError),
    #[error("sandbox launch failed: {0}")]
    Launch(#[from] LaunchError),
    #[error("dispatch task aborted: {0}")]
    Aborted(String),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Unauthorized(_) => StatusCode::FORBIDDEN,
            DispatchError::InvalidPayload(_)
            | DispatchError::MissingRepositoryUrl
            | DispatchError::InvalidRepositoryUrl(_) => StatusCode::BAD_REQUEST,
            DispatchError::TokenExchange(TokenError::Upstream { status, .. })
                if status.is_client_error() || status.is_server_error() =>
            {
                *status
            }
            DispatchError::TokenExchange(_)
            | DispatchError::Launch(_)
            | DispatchError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short text for the caller. Upstream bodies and secrets never appear here.
    pub fn detail(&self) -> &'static str {
        match self {
            DispatchError::Unauthorized(SignatureError::Missing) => "Signature missing",
            DispatchError::Unauthorized(SignatureError::Mismatch) => "Invalid signature",
            DispatchError::Unauthorized(SignatureError::SecretNotConfigured) => {
                "Webhook secret not configured"
            }
            DispatchError::InvalidPayload(_) => "Invalid JSON",
            DispatchError::MissingRepositoryUrl => "Missing repository URL",
            DispatchError::InvalidRepositoryUrl(_) => "Invalid repository URL",
            DispatchError::TokenExchange(TokenError::Upstream { .. }) => {
                "Failed to generate JIT config"
            }
            DispatchError::TokenExchange(_) | DispatchError::Aborted(_) => {
                "Internal server error"
            }
            DispatchError::Launch(_) => "Failed to spawn runner sandbox",
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorBody {
                detail: self.detail().to_string(),
            }),
        )
            .into_response()
    }
}

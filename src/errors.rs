use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::mcp::types::Envelope;

/// Bearer authentication failures. Always surfaced as 401 with a
/// `WWW-Authenticate` challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed Authorization header, expected 'Bearer <token>'")]
    InvalidHeader,

    #[error("invalid or revoked token")]
    InvalidToken,

    #[error("token has expired")]
    Expired,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidHeader => "invalid_header",
            AuthError::InvalidToken => "invalid_token",
            AuthError::Expired => "expired",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("token lacks the '{0}' scope")]
    InsufficientScope(String),

    #[error("invalid client credentials")]
    InvalidClient,

    #[error("rate limit exceeded, retry in {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("request is missing the 'command' field")]
    MissingCommand,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("pageSize must be an integer between 1 and {max}")]
    InvalidPageSize { max: usize },

    #[error("postTypes must be an array of strings")]
    InvalidPostTypes,

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("field '{0}' is not filterable")]
    UnallowlistedField(String),

    #[error("unknown post type '{0}'")]
    InvalidPostType(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Auth(e) => e.code(),
            AppError::InsufficientScope(_) => "insufficient_scope",
            AppError::InvalidClient => "invalid_client",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::MissingCommand => "missing_command",
            AppError::UnknownCommand(_) => "unknown_command",
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::InvalidPageSize { .. } => "invalid_page_size",
            AppError::InvalidPostTypes => "invalid_post_types",
            AppError::InvalidFilter(_) => "invalid_filter",
            AppError::UnallowlistedField(_) => "unallowlisted_field",
            AppError::InvalidPostType(_) => "invalid_post_type",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(_) | AppError::InvalidClient => StatusCode::UNAUTHORIZED,
            AppError::InsufficientScope(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidPostType(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Message safe to hand to the caller. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Render the error as an envelope response.
    ///
    /// `resource_metadata` is the protected-resource discovery URL advertised
    /// in the `WWW-Authenticate` challenge of 401 responses.
    pub fn into_envelope_response(
        self,
        request_id: Option<serde_json::Value>,
        resource_metadata: Option<&str>,
    ) -> Response {
        let status = self.status();
        let envelope = Envelope::failure(self.code(), self.public_message(), request_id);
        let mut response = (status, axum::Json(envelope)).into_response();

        if let AppError::RateLimited { retry_after } = self {
            if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
        }

        if status == StatusCode::UNAUTHORIZED {
            let challenge = bearer_challenge(self.code(), resource_metadata);
            if let Ok(v) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert("www-authenticate", v);
            }
        }

        response
    }
}

/// Build the `WWW-Authenticate` value for a failed bearer check.
pub fn bearer_challenge(code: &str, resource_metadata: Option<&str>) -> String {
    match resource_metadata {
        Some(url) => format!(
            r#"Bearer realm="loupe-mcp", error="{}", resource_metadata="{}""#,
            code, url
        ),
        None => format!(r#"Bearer realm="loupe-mcp", error="{}""#, code),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_envelope_response(None, None)
    }
}

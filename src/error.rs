//! Error types for the proxy and their translation into API error envelopes.

use axum::http::StatusCode;
use thiserror::Error;

use crate::translate::openai_types::{ApiError, ApiErrorType};

const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{message}")]
    InvalidRequest { message: String },

    /// Already shaped as a front-facing error; passed through untouched.
    #[error("{}", .0.message)]
    Api(ApiError),

    /// The backend answered with a non-success HTTP status.
    #[error("Backend returned status {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Unexpected backend response: {message}")]
    UnexpectedResponse { message: String },

    #[error("Stream error: {message}")]
    Stream { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn backend(status: u16, msg: impl Into<String>) -> Self {
        Self::Backend {
            status,
            message: msg.into(),
        }
    }

    pub fn unexpected_response(msg: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            message: msg.into(),
        }
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream {
            message: msg.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Classify an error into the HTTP status and envelope the client sees.
pub fn translate_error(err: &ProxyError) -> (StatusCode, ApiError) {
    match err {
        ProxyError::Api(api) => {
            let status = StatusCode::from_u16(api.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, api.clone())
        }
        ProxyError::Backend { status, message } => backend_status_error(*status, message),
        ProxyError::Http(e) => match e.status() {
            Some(status) => backend_status_error(status.as_u16(), &e.to_string()),
            None => server_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        },
        ProxyError::InvalidRequest { message } => (
            StatusCode::BAD_REQUEST,
            ApiError::new(
                StatusCode::BAD_REQUEST.as_u16(),
                ApiErrorType::InvalidRequestError,
                message.clone(),
            ),
        ),
        ProxyError::Config { .. }
        | ProxyError::UnexpectedResponse { .. }
        | ProxyError::Stream { .. }
        | ProxyError::Io(_)
        | ProxyError::Json(_)
        | ProxyError::Toml(_) => server_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn backend_status_error(status: u16, message: &str) -> (StatusCode, ApiError) {
    if status == StatusCode::TOO_MANY_REQUESTS.as_u16() {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            ApiError::new(status, ApiErrorType::RateLimitError, RATE_LIMIT_MESSAGE),
        );
    }

    match StatusCode::from_u16(status) {
        Ok(code) => server_error(code, message.to_string()),
        Err(_) => server_error(StatusCode::BAD_GATEWAY, message.to_string()),
    }
}

fn server_error(status: StatusCode, message: String) -> (StatusCode, ApiError) {
    (
        status,
        ApiError::new(status.as_u16(), ApiErrorType::ServerError, message),
    )
}

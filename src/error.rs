//! Error types for the proxy.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Upstream error: {message}")]
    Upstream {
        message: String,
        status: Option<u16>,
    },

    #[error("Upstream did not respond within {secs}s")]
    Timeout { secs: u64 },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
            status: None,
        }
    }

    pub fn upstream_status(status: u16, msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
            status: Some(status),
        }
    }

    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            secs: timeout.as_secs(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Timeouts count as upstream failures for response purposes.
    pub fn is_upstream(&self) -> bool {
        match self {
            Self::Upstream { .. } | Self::Timeout { .. } => true,
            Self::Http(e) => !e.is_builder(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// HTTP status used when the error is reported before any response bytes are sent.
    pub fn status_code(&self) -> StatusCode {
        if self.is_timeout() {
            return StatusCode::GATEWAY_TIMEOUT;
        }
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            e if e.is_upstream() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the `type` field in the OpenAI error envelope.
    pub fn error_type(&self) -> &'static str {
        if self.is_timeout() {
            return "timeout_error";
        }
        match self {
            Self::Validation { .. } => "invalid_request_error",
            e if e.is_upstream() => "upstream_error",
            _ => "server_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

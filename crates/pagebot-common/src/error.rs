use std::time::Duration;

use thiserror::Error;

/// Errors shared by every pagebot crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// Rejected before any network call (missing key, disallowed key reuse).
    #[error("validation error: {0}")]
    Validation(String),

    /// Upstream inference API failure. `status` is the HTTP status when one was received.
    #[error("{provider} API error: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("media error: {0}")]
    Media(String),

    /// Every stage of a bounded fallback chain failed.
    #[error("exhausted: {0}")]
    Exhausted(String),

    #[error("key pool error: {0}")]
    KeyPool(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a provider error from an HTTP status and response body.
    pub fn http(provider: impl Into<String>, status: u16, body: impl AsRef<str>) -> Self {
        let body = body.as_ref();
        let body = if body.len() > 500 {
            let mut end = 500;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            &body[..end]
        } else {
            body
        };
        Self::Provider {
            provider: provider.into(),
            status: Some(status),
            message: format!("status={status}, body={body}"),
        }
    }

    /// Build a provider error for a transport-level failure (no HTTP status).
    pub fn transport(provider: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Provider {
            provider: provider.into(),
            status: None,
            message: message.to_string(),
        }
    }

    /// HTTP status attached to a provider error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => *status,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

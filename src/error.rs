//! Error Taxonomy
//!
//! Every pipeline failure aborts before persistence. Each variant maps to one
//! HTTP status; 5xx variants never leak internal detail to clients.

use axum::http::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;
use crate::metrics::ParseError;
use crate::pricing::PricingError;

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Slicing failed: {message}")]
    Slicing {
        message: String,
        /// Tail of the engine's stderr/stdout, bounded in size.
        diagnostic: String,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Pricing failed: {0}")]
    Pricing(#[from] PricingError),

    #[error("Signature does not match the stored quote")]
    SignatureMismatch,

    #[error("Malformed signature")]
    MalformedSignature,

    #[error("Quote {0} is locked and cannot change")]
    Conflict(String),

    #[error("Quote not found: {0}")]
    NotFound(String),

    #[error("Stored quote {0} failed integrity verification")]
    Integrity(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QuoteError {
    pub fn slicing(message: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self::Slicing {
            message: message.into(),
            diagnostic: diagnostic.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(ConfigError::EngineUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(ConfigError::UnknownKey { .. }) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidParams(_) | Self::Pricing(_) | Self::MalformedSignature => {
                StatusCode::BAD_REQUEST
            }
            Self::Slicing { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Parse(_) => StatusCode::BAD_GATEWAY,
            Self::SignatureMismatch => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Integrity(_) | Self::Storage(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to return to API callers.
    pub fn public_message(&self) -> String {
        match self {
            Self::Slicing { message, diagnostic } if !diagnostic.is_empty() => {
                format!("Slicing failed: {message} ({diagnostic})")
            }
            Self::Parse(e) => format!("Could not read {} from slicer output", e.field),
            Self::Config(ConfigError::UnknownKey { .. }) => self.to_string(),
            Self::Config(ConfigError::EngineUnavailable(_)) => {
                "Slicing engine is unavailable".to_string()
            }
            Self::Config(_) => "Configuration error".to_string(),
            Self::Integrity(_) | Self::Storage(_) | Self::Serialization(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

//! Provider error types shared by the provider layer and the flow engine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LLMErrorMetadata {
    pub provider: Option<String>,
    pub status: Option<u16>,
    pub retry_after: Option<String>,
}

impl LLMErrorMetadata {
    pub fn new(
        provider: impl Into<String>,
        status: Option<u16>,
        retry_after: Option<String>,
    ) -> Box<Self> {
        Box::new(Self {
            provider: Some(provider.into()),
            status,
            retry_after,
        })
    }
}

/// LLM error types with optional provider metadata
#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LLMError {
    #[error("Authentication failed: {message}")]
    Authentication {
        message: String,
        metadata: Option<Box<LLMErrorMetadata>>,
    },
    #[error("Rate limit exceeded")]
    RateLimit {
        metadata: Option<Box<LLMErrorMetadata>>,
    },
    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        metadata: Option<Box<LLMErrorMetadata>>,
    },
    #[error("Network error: {message}")]
    Network {
        message: String,
        metadata: Option<Box<LLMErrorMetadata>>,
    },
    #[error("Provider error: {message}")]
    Provider {
        message: String,
        metadata: Option<Box<LLMErrorMetadata>>,
    },
    #[error("Request cancelled")]
    Cancelled,
}

impl LLMError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            metadata: None,
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            metadata: None,
        }
    }

    /// HTTP status reported by the provider, when known.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Authentication { metadata, .. }
            | Self::RateLimit { metadata }
            | Self::InvalidRequest { metadata, .. }
            | Self::Network { metadata, .. }
            | Self::Provider { metadata, .. } => metadata.as_ref().and_then(|meta| meta.status),
            Self::Cancelled => None,
        }
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error codes a broker may attach to an `ERROR` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    TokenExpired,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    /// Accepts the snake_case form as well as the upper/kebab variants brokers
    /// tend to emit (`TOKEN_EXPIRED`, `token-expired`).
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "unauthorized" | "401" => Some(Self::Unauthorized),
            "forbidden" | "403" => Some(Self::Forbidden),
            "token_expired" => Some(Self::TokenExpired),
            "not_found" | "404" => Some(Self::NotFound),
            "validation" | "400" => Some(Self::Validation),
            "rate_limited" | "429" => Some(Self::RateLimited),
            "internal" | "500" => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn is_auth(self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::Forbidden | Self::TokenExpired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{}{message}", code_prefix(.code))]
pub struct BrokerError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
}

impl BrokerError {
    pub fn new(code: Option<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn code_prefix(code: &Option<ErrorCode>) -> String {
    code.map(|code| format!("{code:?}: ")).unwrap_or_default()
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use shared::domain::WorkspaceId;

/// Everything a connect attempt needs from the host's auth layer.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity_token: Option<String>,
    pub workspace_id: Option<WorkspaceId>,
    pub subscriber_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field(
                "identity_token",
                &self.identity_token.as_ref().map(|_| "<redacted>"),
            )
            .field("workspace_id", &self.workspace_id)
            .field("subscriber_key", &self.subscriber_key)
            .finish()
    }
}

/// Source of credentials, consulted again on every connect attempt.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self) -> Result<Credentials>;
}

pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Valid,
    Expired,
    Malformed,
}

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    #[serde(default)]
    exp: Option<i64>,
}

/// Reads the `exp` claim without verifying the signature; the broker does
/// that. Tokens without `exp` never expire locally.
pub fn token_status(token: &str, now: DateTime<Utc>) -> TokenStatus {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<ExpiryClaims>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => match data.claims.exp {
            Some(exp) if exp <= now.timestamp() => TokenStatus::Expired,
            _ => TokenStatus::Valid,
        },
        Err(_) => TokenStatus::Malformed,
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;

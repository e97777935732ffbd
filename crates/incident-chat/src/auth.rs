//! Bearer token handling.
//!
//! Token issuance and refresh belong to the host application. The core only
//! asks a [`TokenProvider`] for the current token right before it needs one
//! (every REST call and every socket connect), so a refreshed token is picked
//! up on the next reconnect without any coordination.

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

const REDACTED: &str = "[REDACTED]";

/// A bearer token that never prints itself.
///
/// Both `{}` and `{:?}` render a placeholder, so a token can sit in a struct
/// that gets logged. Read it with [`SecretString::expose_secret`].
///
/// ```
/// use incident_chat::SecretString;
///
/// let token = SecretString::new("eyJhbGciOi...");
/// assert_eq!(format!("{token:?}"), "[REDACTED]");
/// assert_eq!(token.expose_secret(), "eyJhbGciOi...");
/// ```
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl From<String> for SecretString {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for SecretString {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Supplies the bearer token used for REST calls and socket URLs.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<SecretString>;
}

/// A fixed token, for tools and tests that do not refresh.
#[derive(Debug, Clone)]
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: impl Into<SecretString>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<SecretString> {
        Ok(self.0.clone())
    }
}

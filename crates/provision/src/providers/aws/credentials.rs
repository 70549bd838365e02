//! AWS credentials.

use crate::providers::traits::ProviderError;

/// Static AWS credentials used to sign requests.
#[derive(Clone)]
pub struct Credentials {
    /// AWS access key ID.
    pub access_key_id: String,
    /// AWS secret access key.
    pub secret_access_key: String,
    /// Session token for temporary credentials.
    pub session_token: Option<String>,
}

impl Credentials {
    /// Create credentials from an access key pair.
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Attach a session token.
    #[must_use]
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the optional
    /// `AWS_SESSION_TOKEN` from the environment.
    ///
    /// # Errors
    /// Returns [`ProviderError::Config`] if a required variable is missing.
    pub fn from_env() -> Result<Self, ProviderError> {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
        };
        let access_key_id = var("AWS_ACCESS_KEY_ID")
            .ok_or_else(|| ProviderError::Config("AWS_ACCESS_KEY_ID is not set".to_string()))?;
        let secret_access_key = var("AWS_SECRET_ACCESS_KEY")
            .ok_or_else(|| ProviderError::Config("AWS_SECRET_ACCESS_KEY is not set".to_string()))?;

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: var("AWS_SESSION_TOKEN"),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

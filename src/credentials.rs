//! Credential provider seam.
//!
//! Backends query credentials at instantiation; where the keys live
//! (keychain, env, test fixtures) is the host's business.

use crate::error::{AgentError, Result};

/// Supplies API keys and the optional voice identifier.
pub trait CredentialProvider: Send + Sync {
    /// The provider API key. Must not be empty.
    fn api_key(&self) -> Result<String>;

    /// Preferred voice identifier, if the host pinned one.
    fn voice(&self) -> Option<String> {
        None
    }
}

/// Resolves the API key from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    key_var: String,
    voice_var: String,
}

impl EnvCredentials {
    pub fn new(key_var: impl Into<String>, voice_var: impl Into<String>) -> Self {
        Self {
            key_var: key_var.into(),
            voice_var: voice_var.into(),
        }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new("OPENAI_API_KEY", "WISP_VOICE")
    }
}

impl CredentialProvider for EnvCredentials {
    fn api_key(&self) -> Result<String> {
        let value = std::env::var(&self.key_var).map_err(|_| {
            AgentError::Credentials(format!("credential env var is missing: {}", self.key_var))
        })?;
        if value.trim().is_empty() {
            return Err(AgentError::Credentials(format!(
                "credential env var is empty: {}",
                self.key_var
            )));
        }
        Ok(value.trim().to_owned())
    }

    fn voice(&self) -> Option<String> {
        std::env::var(&self.voice_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

/// Fixed credentials for tests and embedded hosts.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    pub key: String,
    pub voice: Option<String>,
}

impl StaticCredentials {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            voice: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn api_key(&self) -> Result<String> {
        if self.key.trim().is_empty() {
            return Err(AgentError::Credentials("static API key is empty".into()));
        }
        Ok(self.key.clone())
    }

    fn voice(&self) -> Option<String> {
        self.voice.clone()
    }
}

//! API key pair used by the `public/auth` handshake

use serde::Deserialize;
use std::fmt;
use std::path::Path;

pub const ENV_CLIENT_ID: &str = "DERIBIT_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "DERIBIT_CLIENT_SECRET";

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("Failed to read credentials file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse credentials: {0}")]
    Parse(String),
    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error("Credentials field {0} is empty")]
    Empty(&'static str),
}

/// Client id and secret
///
/// The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    client_id: String,
    client_secret: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Read `{"client_id": ..., "client_secret": ...}` from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CredentialsError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| CredentialsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, CredentialsError> {
        let credentials: Credentials =
            serde_json::from_str(contents).map_err(|e| CredentialsError::Parse(e.to_string()))?;
        credentials.validate()?;
        Ok(credentials)
    }

    /// Read `DERIBIT_CLIENT_ID` and `DERIBIT_CLIENT_SECRET`
    pub fn from_env() -> Result<Self, CredentialsError> {
        let client_id =
            std::env::var(ENV_CLIENT_ID).map_err(|_| CredentialsError::MissingEnv(ENV_CLIENT_ID))?;
        let client_secret = std::env::var(ENV_CLIENT_SECRET)
            .map_err(|_| CredentialsError::MissingEnv(ENV_CLIENT_SECRET))?;
        let credentials = Self::new(client_id, client_secret);
        credentials.validate()?;
        Ok(credentials)
    }

    fn validate(&self) -> Result<(), CredentialsError> {
        if self.client_id.is_empty() {
            return Err(CredentialsError::Empty("client_id"));
        }
        if self.client_secret.is_empty() {
            return Err(CredentialsError::Empty("client_secret"));
        }
        Ok(())
    }

    #[inline]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[inline]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

//! Settings errors.

use thiserror::Error;
use truenas_core::ClientError;
use truenas_core::credentials::CredentialsError;

/// Why client settings could not be loaded or used.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The settings file is not valid JSON for [`ClientSettings`](crate::ClientSettings).
    #[error("malformed settings file: {0}")]
    Json(#[from] serde_json::Error),
    /// A value is out of range or empty.
    #[error("bad setting: {0}")]
    InvalidValue(String),
    /// The credential fields do not describe exactly one login.
    #[error("bad credentials: {0}")]
    Credentials(#[from] CredentialsError),
}

/// Settings result alias.
pub type Result<T> = std::result::Result<T, SettingsError>;

impl From<SettingsError> for ClientError {
    fn from(err: SettingsError) -> Self {
        Self::Configuration(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

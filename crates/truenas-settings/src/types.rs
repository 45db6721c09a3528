//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file may be partial and missing fields keep their default value.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use truenas_core::Credentials;

use crate::errors::{Result, SettingsError};

/// Root settings type for one client connection.
///
/// ```json
/// {
///   "host": "nas.local",
///   "secure": false,
///   "credentials": { "apiKey": "1-abcdef" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Host name (optionally with `:port`) of the appliance.
    pub host: String,
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,
    /// How long to wait for the `connected` reply, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Capacity of the command channel into the dispatch task.
    pub command_buffer: usize,
    /// Default log level for binaries (overridden by `RUST_LOG`).
    pub log_level: String,
    /// Login credentials.
    pub credentials: CredentialSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            secure: true,
            handshake_timeout_ms: 10_000,
            command_buffer: 64,
            log_level: "warn".to_string(),
            credentials: CredentialSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Websocket endpoint URL, `ws[s]://<host>/websocket`.
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}/websocket", self.host)
    }

    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Resolve the configured credentials into exactly one credential kind.
    pub fn credentials(&self) -> Result<Credentials> {
        let c = &self.credentials;
        Ok(Credentials::from_parts(
            c.username.as_deref(),
            c.password.as_deref(),
            c.api_key.as_deref(),
            c.token.as_deref(),
        )?)
    }

    /// Check values that serde cannot reject on its own.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("host must not be empty".into()));
        }
        if self.command_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "commandBuffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Credential fields as they appear in the settings file.
///
/// Exactly one kind must end up set; see [`ClientSettings::credentials`].
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialSettings {
    /// Account name for password login.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Account password for password login.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl std::fmt::Debug for CredentialSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("CredentialSettings")
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("api_key", &redact(&self.api_key))
            .field("token", &redact(&self.token))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

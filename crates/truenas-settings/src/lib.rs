//! # truenas-settings
//!
//! Client configuration loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ClientSettings::default()`]
//! 2. **User file**: `~/.truenas/client.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TRUENAS_*` overrides (highest priority)
//!
//! [`ClientSettings::credentials`] is the credential provider consumed by
//! the protocol engine: it yields exactly one credential kind or an error.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{ClientSettings, CredentialSettings};

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = ClientSettings::default();
        let path = settings_path();
        assert!(path.ends_with(".truenas/client.json"));
    }
}

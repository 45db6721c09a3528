//! Login credentials.
//!
//! Exactly one credential kind is used per connection. [`Credentials::from_parts`]
//! applies the same rules whether the values come from a settings file,
//! environment variables or command-line flags.

use std::fmt;

use serde_json::{Value, json};
use thiserror::Error;

/// Credentials presented during the authentication step of the handshake.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Username and password (`auth.login`).
    Password {
        /// Account name.
        username: String,
        /// Account password.
        password: String,
    },
    /// API key (`auth.login_with_api_key`).
    ApiKey(String),
    /// Bearer token (`auth.token`).
    Token(String),
}

/// Why a set of credential parts could not form [`Credentials`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialsError {
    /// More than one credential kind was supplied.
    #[error("only one of username/password, api key or token can be used")]
    Conflicting,
    /// A password was given without a username.
    #[error("username is missing")]
    MissingUsername,
    /// A username was given without a password.
    #[error("password is missing")]
    MissingPassword,
    /// Nothing was supplied.
    #[error("either username/password, api key or token must be given")]
    Missing,
}

impl Credentials {
    /// Build credentials from optional parts, enforcing exactly one kind.
    ///
    /// Empty strings count as absent.
    pub fn from_parts(
        username: Option<&str>,
        password: Option<&str>,
        api_key: Option<&str>,
        token: Option<&str>,
    ) -> Result<Self, CredentialsError> {
        fn present(v: Option<&str>) -> Option<&str> {
            v.filter(|s| !s.is_empty())
        }

        let username = present(username);
        let password = present(password);
        let api_key = present(api_key);
        let token = present(token);

        let user_pass = username.is_some() || password.is_some();
        let kinds = usize::from(user_pass) + usize::from(api_key.is_some()) + usize::from(token.is_some());
        if kinds > 1 {
            return Err(CredentialsError::Conflicting);
        }

        match (username, password, api_key, token) {
            (Some(u), Some(p), _, _) => Ok(Self::Password {
                username: u.to_owned(),
                password: p.to_owned(),
            }),
            (None, Some(_), _, _) => Err(CredentialsError::MissingUsername),
            (Some(_), None, _, _) => Err(CredentialsError::MissingPassword),
            (None, None, Some(key), _) => Ok(Self::ApiKey(key.to_owned())),
            (None, None, None, Some(token)) => Ok(Self::Token(token.to_owned())),
            (None, None, None, None) => Err(CredentialsError::Missing),
        }
    }

    /// The login method name and its ordered parameters.
    #[must_use]
    pub fn login_call(&self) -> (&'static str, Vec<Value>) {
        match self {
            Self::Password { username, password } => {
                ("auth.login", vec![json!(username), json!(password)])
            }
            Self::ApiKey(key) => ("auth.login_with_api_key", vec![json!(key)]),
            Self::Token(token) => ("auth.token", vec![json!(token)]),
        }
    }

    /// Short name of the credential kind, safe to log.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::ApiKey(_) => "api_key",
            Self::Token(_) => "token",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Self::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_and_password() {
        let creds = Credentials::from_parts(Some("root"), Some("secret"), None, None).unwrap();
        let (method, params) = creds.login_call();
        assert_eq!(method, "auth.login");
        assert_eq!(params, vec![json!("root"), json!("secret")]);
    }

    #[test]
    fn api_key_only() {
        let creds = Credentials::from_parts(None, None, Some("1-abc"), None).unwrap();
        assert_eq!(creds.login_call().0, "auth.login_with_api_key");
        assert_eq!(creds.kind(), "api_key");
    }

    #[test]
    fn token_only() {
        let creds = Credentials::from_parts(None, None, None, Some("tok")).unwrap();
        assert_eq!(creds.login_call(), ("auth.token", vec![json!("tok")]));
    }

    #[test]
    fn api_key_with_password_conflicts() {
        let err = Credentials::from_parts(Some("root"), Some("pw"), Some("key"), None).unwrap_err();
        assert_eq!(err, CredentialsError::Conflicting);
        let err = Credentials::from_parts(None, Some("pw"), Some("key"), None).unwrap_err();
        assert_eq!(err, CredentialsError::Conflicting);
    }

    #[test]
    fn half_a_password_pair() {
        assert_eq!(
            Credentials::from_parts(None, Some("pw"), None, None).unwrap_err(),
            CredentialsError::MissingUsername
        );
        assert_eq!(
            Credentials::from_parts(Some("root"), None, None, None).unwrap_err(),
            CredentialsError::MissingPassword
        );
    }

    #[test]
    fn nothing_given() {
        assert_eq!(
            Credentials::from_parts(None, Some(""), None, None).unwrap_err(),
            CredentialsError::Missing
        );
    }

    #[test]
    fn empty_strings_count_as_absent() {
        let creds = Credentials::from_parts(Some(""), Some(""), Some("1-abc"), Some("")).unwrap();
        assert_eq!(creds, Credentials::ApiKey("1-abc".into()));
    }

    #[test]
    fn debug_redacts_secrets() {
        let creds = Credentials::from_parts(Some("root"), Some("hunter2"), None, None).unwrap();
        let shown = format!("{creds:?}");
        assert!(shown.contains("root"));
        assert!(!shown.contains("hunter2"));
        let shown = format!("{:?}", Credentials::ApiKey("k-123".into()));
        assert!(!shown.contains("k-123"));
    }
}

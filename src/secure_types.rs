//! Secure Types Module
//!
//! Credential containers that zero their contents from memory when dropped.
//! Used for the directory bind account and the transactional sink's
//! `username:password` pair.

use base64::{engine::general_purpose, Engine as _};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secure string that automatically zeros its contents when dropped.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecureString {
    inner: String,
}

impl SecureString {
    pub fn new(s: String) -> Self {
        Self { inner: s }
    }

    /// Temporarily exposes the secret as a string slice.
    ///
    /// The returned reference should be used immediately and not stored.
    pub fn expose_secret(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureString([REDACTED])")
    }
}

impl fmt::Display for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Username/password pair with the password zeroed on drop.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: String,
    password: SecureString,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Self {
        Self {
            username,
            password: SecureString::new(password),
        }
    }

    /// Splits a `username:password` string on the first colon.
    ///
    /// A string without a colon is treated as a username with an empty password.
    pub fn from_user_pass(user_pass: &str) -> Self {
        match user_pass.split_once(':') {
            Some((user, pass)) => Self::new(user.to_string(), pass.to_string()),
            None => Self::new(user_pass.to_string(), String::new()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Temporarily exposes the password as a string slice.
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// True when no bind account is configured (anonymous or integrated bind).
    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
    }

    /// `Basic <base64(username:password)>` value for an `Authorization` header.
    pub fn basic_auth_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password());
        format!("Basic {}", general_purpose::STANDARD.encode(raw.as_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_string_redacted() {
        let s = SecureString::new("hunter2".to_string());
        assert_eq!(format!("{}", s), "[REDACTED]");
        assert_eq!(format!("{:?}", s), "SecureString([REDACTED])");
        assert_eq!(s.expose_secret(), "hunter2");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("neo4j".to_string(), "secret".to_string());
        let debug = format!("{:?}", creds);
        assert!(debug.contains("neo4j"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_from_user_pass_splits_on_first_colon() {
        let creds = Credentials::from_user_pass("neo4j:pa:ss");
        assert_eq!(creds.username(), "neo4j");
        assert_eq!(creds.password(), "pa:ss");

        let creds = Credentials::from_user_pass("lonely");
        assert_eq!(creds.username(), "lonely");
        assert_eq!(creds.password(), "");
    }

    #[test]
    fn test_basic_auth_header() {
        let creds = Credentials::from_user_pass("neo4j:BloodHound");
        // base64("neo4j:BloodHound")
        assert_eq!(creds.basic_auth_header(), "Basic bmVvNGo6Qmxvb2RIb3VuZA==");
    }
}

//! Error handling module
//!
//! Structured error types for the collector. Per-host, per-GPO and per-member
//! failures are all expressed through [`CollectorError`] so callers can switch
//! on the kind instead of unwinding.

use thiserror::Error;

/// Main error type for collection operations
#[derive(Error, Debug)]
pub enum CollectorError {
    /// Host did not answer, or the transport failed mid-enumeration
    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    /// Structured local-group query rejected by the host (non-transport failure)
    #[error("Enumeration unsupported: {0}")]
    EnumerationUnsupported(String),

    /// No table, cache, directory or heuristic match for a SID
    #[error("Identity unresolvable: {0}")]
    IdentityUnresolvable(String),

    /// LDAP connection error
    #[error("LDAP connection failed: {0}")]
    ConnectionError(String),

    /// LDAP query/search error
    #[error("LDAP query failed: {0}")]
    QueryError(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Parse error
    #[error("Failed to parse data: {0}")]
    ParseError(String),

    /// Output sink error (file or network)
    #[error("Output sink failure: {0}")]
    SinkError(String),

    /// Object store error
    #[error("Object store error: {0}")]
    StoreError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl CollectorError {
    /// True for transport-level failures that mark a host dead
    pub fn is_host_unreachable(&self) -> bool {
        matches!(
            self,
            CollectorError::HostUnreachable(_) | CollectorError::ConnectionError(_)
        )
    }

    /// True when the primary strategy should fall back to the legacy provider
    pub fn is_unsupported(&self) -> bool {
        matches!(self, CollectorError::EnumerationUnsupported(_))
    }
}

impl From<ldap3::LdapError> for CollectorError {
    fn from(err: ldap3::LdapError) -> Self {
        match err {
            ldap3::LdapError::LdapResult { result } => match result.rc {
                // 49 = Invalid credentials
                49 => CollectorError::AuthError(format!("Invalid credentials: {}", result.text)),
                // 32 = No such object
                32 => CollectorError::NotFound(format!("Object not found: {}", result.text)),
                // 50 = Insufficient access rights, 53 = Unwilling to perform
                50 | 53 => CollectorError::AuthError(format!(
                    "Access denied (rc={}): {}",
                    result.rc, result.text
                )),
                // 51 = Busy
                51 => CollectorError::Timeout(format!("Server is busy: {}", result.text)),
                // 52 = Unavailable
                52 => CollectorError::ConnectionError(format!(
                    "Server unavailable: {}",
                    result.text
                )),
                _ => CollectorError::QueryError(format!(
                    "LDAP error code {}: {}",
                    result.rc, result.text
                )),
            },
            ldap3::LdapError::EndOfStream => {
                CollectorError::ConnectionError("Connection closed unexpectedly".to_string())
            }
            ldap3::LdapError::Io { source } => {
                CollectorError::ConnectionError(format!("I/O error: {}", source))
            }
            ldap3::LdapError::Timeout { elapsed: _ } => {
                CollectorError::Timeout("LDAP operation timed out".to_string())
            }
            _ => CollectorError::QueryError(format!("LDAP error: {}", err)),
        }
    }
}

impl From<anyhow::Error> for CollectorError {
    fn from(err: anyhow::Error) -> Self {
        CollectorError::InternalError(err.to_string())
    }
}

impl From<std::io::Error> for CollectorError {
    fn from(err: std::io::Error) -> Self {
        CollectorError::SinkError(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        CollectorError::ParseError(format!("JSON error: {}", err))
    }
}

impl From<rusqlite::Error> for CollectorError {
    fn from(err: rusqlite::Error) -> Self {
        CollectorError::StoreError(err.to_string())
    }
}

impl From<csv::Error> for CollectorError {
    fn from(err: csv::Error) -> Self {
        CollectorError::SinkError(format!("CSV error: {}", err))
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(err: reqwest::Error) -> Self {
        CollectorError::SinkError(format!("HTTP error: {}", err))
    }
}

impl From<tokio::task::JoinError> for CollectorError {
    fn from(err: tokio::task::JoinError) -> Self {
        CollectorError::InternalError(format!("Task join error: {}", err))
    }
}

/// Result type alias for collector operations
pub type Result<T> = std::result::Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CollectorError::HostUnreachable("ws01".to_string());
        assert_eq!(err.to_string(), "Host unreachable: ws01");

        let err = CollectorError::EnumerationUnsupported("status 5".to_string());
        assert_eq!(err.to_string(), "Enumeration unsupported: status 5");

        let err = CollectorError::SinkError("disk full".to_string());
        assert_eq!(err.to_string(), "Output sink failure: disk full");
    }

    #[test]
    fn test_kind_helpers() {
        assert!(CollectorError::HostUnreachable("x".into()).is_host_unreachable());
        assert!(CollectorError::ConnectionError("x".into()).is_host_unreachable());
        assert!(!CollectorError::EnumerationUnsupported("x".into()).is_host_unreachable());
        assert!(CollectorError::EnumerationUnsupported("x".into()).is_unsupported());
        assert!(!CollectorError::QueryError("x".into()).is_unsupported());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CollectorError = io_err.into();
        assert!(matches!(err, CollectorError::SinkError(_)));
    }

    #[test]
    fn test_anyhow_error_conversion() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let err: CollectorError = anyhow_err.into();
        assert!(matches!(err, CollectorError::InternalError(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CollectorError = json_err.into();
        assert!(matches!(err, CollectorError::ParseError(_)));
    }
}

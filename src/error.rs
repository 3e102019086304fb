//! Error types for the pagespeed rewrite core

use thiserror::Error;

/// Result type alias for rewrite operations
pub type Result<T> = std::result::Result<T, PagespeedError>;

/// Error types that can occur in the rewrite core
#[derive(Error, Debug, Clone)]
pub enum PagespeedError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Cache backend unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Fetch error for {url}: {message}")]
    FetchError { url: String, message: String },

    #[error("Origin server returned 4xx error: {status} - {message}")]
    OriginClientError { status: u16, message: String },

    #[error("Origin server returned 5xx error: {status} - {message}")]
    OriginServerError { status: u16, message: String },

    #[error("Fetch dropped by rate control: {0}")]
    FetchDropped(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Optimizer declined: {0}")]
    OptimizerDeclined(String),

    #[error("Not rewritable: {0}")]
    PolicyViolation(String),

    #[error("Invalid driver state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for PagespeedError {
    fn from(err: std::io::Error) -> Self {
        PagespeedError::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PagespeedError {
    fn from(err: serde_yaml::Error) -> Self {
        PagespeedError::ConfigError(err.to_string())
    }
}

impl From<bincode::Error> for PagespeedError {
    fn from(err: bincode::Error) -> Self {
        PagespeedError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for PagespeedError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        if err.is_timeout() {
            PagespeedError::Timeout(format!("{}: {}", url, err))
        } else {
            PagespeedError::FetchError {
                url,
                message: err.to_string(),
            }
        }
    }
}

impl PagespeedError {
    /// Determine if this error should trigger a retry
    ///
    /// 5xx responses, timeouts, transport and IO failures are retried.
    /// 4xx responses, policy and content errors never are.
    pub fn should_retry(&self) -> bool {
        match self {
            PagespeedError::OriginServerError { .. } => true,
            PagespeedError::Timeout(_) => true,
            PagespeedError::IoError(_) => true,
            PagespeedError::FetchError { .. } => true,

            PagespeedError::OriginClientError { .. } => false,
            PagespeedError::FetchDropped(_) => false,
            _ => false,
        }
    }

    /// Transient I/O: recovered locally by retry or tier fall-through, never surfaced
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PagespeedError::IoError(_)
                | PagespeedError::CacheError(_)
                | PagespeedError::CacheUnavailable(_)
                | PagespeedError::Timeout(_)
                | PagespeedError::FetchError { .. }
                | PagespeedError::FetchDropped(_)
                | PagespeedError::OriginServerError { .. }
        )
    }

    /// Content errors are cached negatively and abandon the slot
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            PagespeedError::OptimizerDeclined(_)
                | PagespeedError::ParseError(_)
                | PagespeedError::OriginClientError { .. }
        )
    }

    /// Policy errors make the request bypass rewriting
    pub fn is_policy(&self) -> bool {
        matches!(self, PagespeedError::PolicyViolation(_))
    }

    /// Fatal errors abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, PagespeedError::ConfigError(_))
    }

    /// Create an error from an HTTP status code
    ///
    /// Automatically categorizes as 4xx or 5xx error
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            PagespeedError::OriginClientError { status, message }
        } else if (500..600).contains(&status) {
            PagespeedError::OriginServerError { status, message }
        } else {
            PagespeedError::FetchError {
                url: String::new(),
                message: format!("HTTP {}: {}", status, message),
            }
        }
    }

    pub(crate) fn invalid_state(expected: impl Into<String>, actual: impl std::fmt::Debug) -> Self {
        PagespeedError::InvalidState {
            expected: expected.into(),
            actual: format!("{:?}", actual),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            PagespeedError::from_http_status(404, "missing"),
            PagespeedError::OriginClientError { status: 404, .. }
        ));
        assert!(matches!(
            PagespeedError::from_http_status(503, "busy"),
            PagespeedError::OriginServerError { status: 503, .. }
        ));
    }

    #[test]
    fn test_taxonomy() {
        assert!(PagespeedError::Timeout("x".into()).is_transient());
        assert!(PagespeedError::OptimizerDeclined("x".into()).is_content());
        assert!(PagespeedError::PolicyViolation("x".into()).is_policy());
        assert!(PagespeedError::ConfigError("x".into()).is_fatal());
        assert!(!PagespeedError::from_http_status(404, "").should_retry());
        assert!(PagespeedError::from_http_status(502, "").should_retry());
    }
}

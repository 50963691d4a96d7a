//! Error types for tabletloc

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Metadata Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Stale write conflict on {key}: record changed since it was read")]
    StaleWriteConflict { key: String },

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === State Machine Errors ===
    #[error("Invalid transition: {event} is not allowed from {from}")]
    InvalidTransition { from: String, event: String },

    // === Assignment Errors ===
    #[error("No live tablet servers available")]
    NoLiveServers,

    #[error("Tablet not hosted here: {0}")]
    NotHosted(String),

    // === Coordination Errors ===
    #[error("Coordination session lost: {0}")]
    CoordinationSessionLost(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Watch budget violated: {observed} active watches, expected {min}..={max}")]
    WatchBudgetViolated { observed: u64, min: u64, max: u64 },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StaleWriteConflict { .. }
                | Error::Timeout(_)
                | Error::CoordinationSessionLost(_)
                | Error::NoLiveServers
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::StaleWriteConflict { .. } => StatusCode::CONFLICT,
            Error::ConfigurationInvalid(_) | Error::InvalidTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NoLiveServers | Error::NotHosted(_) | Error::CoordinationSessionLost(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::ConfigurationInvalid(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_retryable() {
        assert!(Error::StaleWriteConflict { key: "t1".into() }.is_retryable());
        assert!(Error::Timeout("flush".into()).is_retryable());
        assert!(!Error::NotFound("t1".into()).is_retryable());
        assert!(!Error::ConfigurationInvalid("mode".into()).is_retryable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            Error::NotFound("t".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Timeout("t".into()).to_http_status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            Error::InvalidTransition {
                from: "unassigned".into(),
                event: "take-offline".into()
            }
            .to_http_status(),
            StatusCode::BAD_REQUEST
        );
    }
}

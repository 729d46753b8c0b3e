//! Error types for the reporting core

use std::fmt;

pub type Result<T> = std::result::Result<T, ReporterError>;

#[derive(Debug)]
pub enum ReporterError {
    /// Bounded queue rejected a record because it was at capacity
    QueueFull { queue: &'static str },

    /// Collector could not be reached (connect failure, timeout, 5xx, throttling)
    TransportUnavailable(String),

    /// Collector refused the request (auth failure, malformed payload)
    Rejected(String),

    /// A record could not be serialized for the wire
    Serialization(serde_json::Error),

    /// HTTP client error that could not be classified further
    Http(reqwest::Error),

    /// Configuration error
    Config(String),

    /// A background task could not be scheduled
    Scheduling(String),
}

impl ReporterError {
    /// Whether the next backoff cycle has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReporterError::TransportUnavailable(_) | ReporterError::Http(_)
        )
    }
}

impl fmt::Display for ReporterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReporterError::QueueFull { queue } => write!(f, "{} queue is full", queue),
            ReporterError::TransportUnavailable(msg) => write!(f, "Transport unavailable: {}", msg),
            ReporterError::Rejected(msg) => write!(f, "Rejected by collector: {}", msg),
            ReporterError::Serialization(err) => write!(f, "Serialization error: {}", err),
            ReporterError::Http(err) => write!(f, "HTTP error: {}", err),
            ReporterError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ReporterError::Scheduling(msg) => write!(f, "Scheduling failure: {}", msg),
        }
    }
}

impl std::error::Error for ReporterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReporterError::Serialization(err) => Some(err),
            ReporterError::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ReporterError {
    fn from(err: serde_json::Error) -> Self {
        ReporterError::Serialization(err)
    }
}

impl From<reqwest::Error> for ReporterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            ReporterError::TransportUnavailable(err.to_string())
        } else {
            ReporterError::Http(err)
        }
    }
}

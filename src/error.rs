use crate::models::Exchange;
use thiserror::Error;

/// Error surfaced by one exchange adapter call.
///
/// Scoped to a single exchange and operation so a failure never has to
/// abort more than the position being evaluated.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{exchange} {operation}: network error: {source}")]
    Network {
        exchange: Exchange,
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{exchange} {operation}: HTTP {status}: {body}")]
    Http {
        exchange: Exchange,
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// Rate-limit rejection (HTTP 429 or exchange throttle code). Already
    /// reported to the limiter by the time this is returned.
    #[error("{exchange} {operation}: throttled by exchange")]
    Throttled {
        exchange: Exchange,
        operation: &'static str,
    },

    /// Credential or HMAC failure. Fatal for this exchange this cycle.
    #[error("{exchange}: request signing failed: {message}")]
    Signing { exchange: Exchange, message: String },

    #[error("{exchange} {operation}: malformed response: {message}")]
    MalformedResponse {
        exchange: Exchange,
        operation: &'static str,
        message: String,
    },

    /// Empty or missing record for a status query. "Nothing to report",
    /// not a failure.
    #[error("{exchange} {operation}: not found")]
    NotFound {
        exchange: Exchange,
        operation: &'static str,
    },
}

impl AdapterError {
    /// Transient errors worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Network { .. } | AdapterError::Throttled { .. } => true,
            AdapterError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AdapterError::NotFound { .. })
    }
}

//! Gateway error taxonomy.

use thiserror::Error;

/// Failure of a call to an exchange gateway.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// The request did not complete (connect error, timeout, broken body).
    /// For orders the outcome is unknown: the request may have reached the venue.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Venue-side outage (5xx or maintenance).
    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// The venue processed the request and refused it.
    #[error("rejected by exchange (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Whether retrying the same idempotent read may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_) | GatewayError::RateLimited(_) | GatewayError::Unavailable(_)
        )
    }

    /// Whether an order request failing with this error may nonetheless have been executed.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, GatewayError::Transport(_) | GatewayError::Decode(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

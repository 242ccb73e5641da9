use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// HTTP status codes that indicate a transient provider failure.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum Error {
    /// Provider replied with a non-success status.
    #[error("provider returned HTTP {status}: {message}")]
    Provider { status: u16, message: String },

    /// Network-level failure (timeout, connect, body read).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Provider reply did not carry the expected payload.
    #[error("unexpected provider response: {0}")]
    Parse(String),

    /// Draft did not satisfy the report schema.
    #[error("schema validation failed: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The limiter's wait primitive failed. Not expected in normal
    /// operation; surfaced only so a slot is never silently leaked.
    #[error("rate limiter unavailable: {0}")]
    Limiter(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("pipeline error: {0}")]
    Pipeline(String),
}

impl Error {
    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    /// Whether the request executor should retry after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { status, .. } => RETRYABLE_STATUSES.contains(status),
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(Error::provider(status, "upstream").is_retryable());
        }
    }

    #[test]
    fn client_errors_are_terminal() {
        for status in [400, 401, 403, 404, 422] {
            assert!(!Error::provider(status, "bad request").is_retryable());
        }
    }

    #[test]
    fn parse_and_validation_are_terminal() {
        assert!(!Error::Parse("no choices".into()).is_retryable());
        assert!(!Error::Validation("missing headline".into()).is_retryable());
    }
}

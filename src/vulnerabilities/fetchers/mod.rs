/// The module fetchers defines the vulnerabilities fetchers.
pub mod nvd;

use thiserror::Error;

use crate::models::{Page, QueryWindow};

/// The reasons why a page couldn't be fetched.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request didn't reach the API or the response was cut.
    #[error("error while communicating with the API: {0}")]
    Network(String),
    /// The API answered with a non-success status code.
    #[error("invalid HTTP response code: {0}")]
    Status(u16),
    /// The body is not what the API is supposed to return.
    #[error("invalid response returned by the API: {0}")]
    Payload(String),
}

impl FetchError {
    /// Whether sending the same request again may succeed.
    ///
    /// A malformed query (400), a bad key (401) or a wrong endpoint (404)
    /// will fail the same way every time. The NVD answers 403 when the rate
    /// limit is exceeded, so it is retried like the other statuses.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Payload(_) => true,
            FetchError::Status(code) => !matches!(code, 400 | 401 | 404),
        }
    }
}

/// A common interface between all vulnerabilities fetchers.
pub trait PageFetcher {
    /// Fetches the page of records starting at `start_index` among the
    /// records modified in the window.
    fn fetch_page(
        &self,
        window: &QueryWindow,
        start_index: u64,
        page_size: u32,
    ) -> Result<Page, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(FetchError::Network("connection reset".to_string()).is_retryable());
        assert!(FetchError::Payload("expected value".to_string()).is_retryable());
        assert!(FetchError::Status(403).is_retryable());
        assert!(FetchError::Status(429).is_retryable());
        assert!(FetchError::Status(500).is_retryable());
        assert!(FetchError::Status(503).is_retryable());
    }

    #[test]
    fn request_errors_are_not_retryable() {
        assert!(!FetchError::Status(400).is_retryable());
        assert!(!FetchError::Status(401).is_retryable());
        assert!(!FetchError::Status(404).is_retryable());
    }
}

//! Error taxonomy for the collector core.
//!
//! Three classes matter to callers:
//!
//! | Variant | Meaning | Retried? |
//! |---------|---------|----------|
//! | [`CollectorError::Parsing`] | A manifest or index lacks an expected structural element | No, fatal for the archive |
//! | [`CollectorError::TransientFetch`] | Network failure or a non-2xx, non-4xx status | Yes, via the retry ledger |
//! | [`CollectorError::UnexpectedStatus`] | HTTP 4xx, usually a range computed from stale data | No, logged for investigation |
//!
//! The remaining variants cover local failures (bad domain names, disk and
//! JSON errors).

/// Errors raised by the fetch, search, ledger, and progress layers.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("parsing failure: {0}")]
    Parsing(String),

    #[error("transient fetch error for {url}: {reason}")]
    TransientFetch { url: String, reason: String },

    #[error("unexpected HTTP status {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CollectorError {
    pub fn parsing(message: impl Into<String>) -> Self {
        CollectorError::Parsing(message.into())
    }

    pub fn transient(url: impl Into<String>, reason: impl ToString) -> Self {
        CollectorError::TransientFetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the retry ledger should pick this failure up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollectorError::TransientFetch { .. })
    }

    /// Failures that should park the affected (domain, archive) pair instead
    /// of repeating the same request.
    pub fn is_fatal_for_archive(&self) -> bool {
        matches!(
            self,
            CollectorError::Parsing(_) | CollectorError::UnexpectedStatus { .. }
        )
    }
}

pub type CollectorResult<T> = Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(CollectorError::transient("u", "timeout").is_retryable());
        assert!(!CollectorError::parsing("no cluster.idx").is_retryable());
        let status = CollectorError::UnexpectedStatus {
            url: "u".into(),
            status: 416,
        };
        assert!(!status.is_retryable());
        assert!(status.is_fatal_for_archive());
    }

    #[test]
    fn display_names_the_url() {
        let err = CollectorError::UnexpectedStatus {
            url: "https://data.commoncrawl.org/x".into(),
            status: 404,
        };
        assert_eq!(
            err.to_string(),
            "unexpected HTTP status 404 for https://data.commoncrawl.org/x"
        );
    }
}

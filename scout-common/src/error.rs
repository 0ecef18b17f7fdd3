//! Typed errors for remote-host interaction and discovery passes.

use thiserror::Error;

/// Error returned by remote code-hosting API calls.
///
/// The split between [`RemoteError::Unavailable`] and [`RemoteError::Rejected`]
/// is what drives the retry policy: 5xx and 429 responses are transient and
/// retried, everything else fails immediately.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The remote host answered with a transient failure (HTTP 5xx or 429).
    #[error("remote unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// The remote host rejected the request (HTTP 4xx other than 429).
    #[error("remote rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// A network-level failure that never produced an HTTP status.
    ///
    /// Not retried unless the caller explicitly classifies it retryable
    /// via [`RetryingClient::call_classified`](crate::retry::RetryingClient).
    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Build the appropriate variant from an HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 || status == 429 {
            RemoteError::Unavailable { status, message }
        } else {
            RemoteError::Rejected { status, message }
        }
    }

    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Unavailable { status, .. } | RemoteError::Rejected { status, .. } => {
                Some(*status)
            }
            RemoteError::Transport(_) => None,
        }
    }

    /// Whether the default retry classification applies (5xx or 429).
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Unavailable { .. })
    }

    /// Whether this is the host refusing a regressive commit-status
    /// transition. Treated as benign by the status notifier.
    pub fn is_status_transition_rejection(&self) -> bool {
        match self {
            RemoteError::Rejected { message, .. } => {
                message.to_ascii_lowercase().contains("cannot transition status")
            }
            _ => false,
        }
    }
}

/// Error aborting a discovery pass.
///
/// Partial results already emitted to the observer stand; the pass simply
/// goes no further.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A remote listing or lookup failed beyond retry.
    #[error("remote call failed during discovery: {0}")]
    Remote(#[from] RemoteError),

    /// The build criteria probe failed while evaluating a candidate.
    #[error("criteria probe failed for {head}: {source}")]
    Criteria {
        head: String,
        #[source]
        source: RemoteError,
    },

    /// The request was used after `close()`.
    #[error("discovery request is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_classifies_server_errors_as_unavailable() {
        assert!(RemoteError::from_status(500, "boom").is_retryable());
        assert!(RemoteError::from_status(503, "boom").is_retryable());
        assert!(RemoteError::from_status(429, "slow down").is_retryable());
    }

    #[test]
    fn from_status_classifies_client_errors_as_rejected() {
        let err = RemoteError::from_status(404, "not found");
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn transport_errors_carry_no_status() {
        let err = RemoteError::Transport("connection refused".into());
        assert_eq!(err.status(), None);
        assert!(!err.is_retryable());
    }

    #[test]
    fn status_transition_rejection_is_detected_case_insensitively() {
        let err = RemoteError::from_status(400, "Cannot transition status via :enqueue");
        assert!(err.is_status_transition_rejection());

        let err = RemoteError::from_status(400, "invalid ref");
        assert!(!err.is_status_transition_rejection());

        // Only 4xx rejections qualify; a 500 with the same text is transient.
        let err = RemoteError::from_status(500, "cannot transition status");
        assert!(!err.is_status_transition_rejection());
    }
}

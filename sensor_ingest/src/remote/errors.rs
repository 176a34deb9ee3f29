use thiserror::Error;

use crate::models::api::ErrorCode;

/// Errors that can occur while talking to a remote node.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The request never produced a response (connect failure, timeout, reset).
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The node answered with its JSON error envelope.
    #[error("remote error {code} ({status}): {detail}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Machine-readable code from the envelope.
        code: ErrorCode,
        /// Human-readable detail from the envelope.
        detail: String,
    },

    /// The node answered with a non-success status and no envelope.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Raw response body (possibly truncated).
        body: String,
    },

    /// The response body did not decode.
    #[error("invalid response: {0}")]
    Decode(String),

    /// The configured endpoint is not a usable base URL.
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
}

impl RemoteError {
    /// The envelope code, when the node sent one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RemoteError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for conditions worth retrying on the next scheduled pass.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Request(_) | RemoteError::Decode(_) => true,
            RemoteError::Api { code, status, .. } => {
                matches!(code, ErrorCode::RateLimitExceeded | ErrorCode::InternalError)
                    || *status >= 500
            }
            RemoteError::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            RemoteError::InvalidEndpoint(_) => false,
        }
    }
}

//! Core error types for the Loom pipeline.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Well-known error-code strings surfaced by the metagraph data layer.
///
/// The data layer reports failures as `{code, message}` pairs inside 4xx
/// bodies and rejection webhooks; retry policy keys off these.
pub mod upstream_codes {
    /// The update's `targetSequenceNumber` did not match the fiber's current
    /// sequence. Retryable after rereading state.
    pub const STALE_SEQUENCE: &str = "StaleSequenceNumber";
    /// The referenced content id is not yet visible to the serving node.
    /// Retryable with a longer backoff, typically right after creation.
    pub const CID_NOT_FOUND: &str = "CidNotFound";
    /// The update was not signed by an owner of the fiber.
    pub const NOT_SIGNED_BY_OWNER: &str = "NotSignedByOwner";
    /// A guard expression evaluated to false.
    pub const GUARD_REJECTED: &str = "GuardRejected";
}

/// Errors produced by the data-layer HTTP client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never completed at the transport level.
    #[error("network error: {0}")]
    Network(String),
    /// The request exceeded its deadline.
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    /// The upstream answered with a non-2xx status. The body carries the
    /// server's rationale verbatim and must not be retried blindly.
    #[error("upstream returned {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },
    /// The response decoded to something other than the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ClientError {
    /// Whether this failure is transport-level and safe to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
            || matches!(self, Self::HttpStatus { status, .. } if *status >= 500)
    }

    /// Whether the upstream body mentions the given error code.
    pub fn mentions_code(&self, code: &str) -> bool {
        matches!(self, Self::HttpStatus { body, .. } if body.contains(code))
    }
}

impl ErrorCode for ClientError {
    fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "CLIENT_NETWORK",
            Self::Timeout(_) => "CLIENT_TIMEOUT",
            Self::HttpStatus { .. } => "CLIENT_HTTP_STATUS",
            Self::Malformed(_) => "CLIENT_MALFORMED_RESPONSE",
        }
    }
}

/// Errors surfaced by the bridge submission engine and sequence reconciler.
///
/// Kind discrimination here drives retry policy: `SequenceConflict` means
/// reread-and-retry, `NotReady` means try again later, `Validation` and
/// `Forbidden` must never be retried.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The caller's input was rejected before any network call.
    #[error("invalid request: {0}")]
    Validation(String),
    /// A client-side role guard rejected the caller.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The fiber is not yet visible to the snapshot layer.
    #[error("fiber {0} not visible yet")]
    NotReady(String),
    /// The fiber's current state does not permit the requested operation.
    #[error("operation '{operation}' not allowed in state {current}")]
    StateConflict {
        /// The attempted operation.
        operation: String,
        /// The fiber's current state.
        current: String,
    },
    /// The optimistic-concurrency race was lost even after bounded retries.
    #[error("sequence conflict on fiber {fiber_id} after {attempts} attempts")]
    SequenceConflict {
        /// The contended fiber.
        fiber_id: String,
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// The signer rejected the input.
    #[error("signature refused: {0}")]
    SignatureRefused(String),
    /// A transport-level failure talking to the data layer.
    #[error("transport failure: {0}")]
    Network(ClientError),
    /// The data layer answered with an error status not otherwise classified.
    #[error("upstream error {status}: {body}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },
}

impl BridgeError {
    /// The HTTP status an API surface should translate this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::SignatureRefused(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotReady(_) => 404,
            Self::StateConflict { .. } | Self::SequenceConflict { .. } => 409,
            Self::Network(_) => 502,
            Self::Upstream { status, .. } => *status,
        }
    }

    /// Whether the orchestrator should count this as a failure (vs a skip).
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::NotReady(_) | Self::StateConflict { .. })
    }
}

impl From<ClientError> for BridgeError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::HttpStatus { status, body } => Self::Upstream { status, body },
            other => Self::Network(other),
        }
    }
}

impl ErrorCode for BridgeError {
    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "BRIDGE_VALIDATION",
            Self::Forbidden(_) => "BRIDGE_FORBIDDEN",
            Self::NotReady(_) => "BRIDGE_NOT_READY",
            Self::StateConflict { .. } => "BRIDGE_STATE_CONFLICT",
            Self::SequenceConflict { .. } => "BRIDGE_SEQUENCE_CONFLICT",
            Self::SignatureRefused(_) => "BRIDGE_SIGNATURE_REFUSED",
            Self::Network(_) => "BRIDGE_NETWORK",
            Self::Upstream { .. } => "BRIDGE_UPSTREAM",
        }
    }
}

/// Errors from the indexer's persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend failed.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A stored value failed to decode.
    #[error("corrupt store entry: {0}")]
    Corrupt(String),
    /// The requested record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "STORE_BACKEND_ERROR",
            Self::Corrupt(_) => "STORE_CORRUPT_ENTRY",
            Self::NotFound(_) => "STORE_NOT_FOUND",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_error_http_mapping() {
        assert_eq!(BridgeError::Validation("x".into()).http_status(), 400);
        assert_eq!(BridgeError::Forbidden("x".into()).http_status(), 403);
        assert_eq!(
            BridgeError::StateConflict {
                operation: "open".into(),
                current: "SETTLED".into()
            }
            .http_status(),
            409
        );
        assert_eq!(
            BridgeError::from(ClientError::Timeout(2_000)).http_status(),
            502
        );
    }

    #[test]
    fn client_error_classification() {
        assert!(ClientError::Timeout(10).is_transient());
        assert!(ClientError::HttpStatus {
            status: 503,
            body: String::new()
        }
        .is_transient());
        let conflict = ClientError::HttpStatus {
            status: 400,
            body: r#"{"code":"StaleSequenceNumber"}"#.into(),
        };
        assert!(!conflict.is_transient());
        assert!(conflict.mentions_code(upstream_codes::STALE_SEQUENCE));
    }

    #[test]
    fn not_ready_is_a_skip_not_a_failure() {
        assert!(!BridgeError::NotReady("f".into()).counts_as_failure());
        assert!(BridgeError::SequenceConflict {
            fiber_id: "f".into(),
            attempts: 3
        }
        .counts_as_failure());
    }
}

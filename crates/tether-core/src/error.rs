//! Error types for the tether engine.
//!
//! Every failure a caller can observe carries exactly one tag from the
//! protocol taxonomy (`FailureKind`). Transport and serialisation errors
//! keep their sources for logging but collapse onto the taxonomy at the
//! wire boundary.

use crate::protocol::{FailureKind, RpcFailure};
use thiserror::Error;

/// Main error type for tether operations.
///
/// `Timeout` and `QueueOverflow` keep their detail as a message rather
/// than structured fields so an error rebuilt from a wire failure is
/// indistinguishable from a locally-raised one; use
/// [`RpcError::timeout`] and [`RpcError::queue_overflow`] to construct
/// them locally.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{message}")]
    Timeout { id: i64, message: String },

    #[error("network problem: {message}")]
    NetworkProblem {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("{message}")]
    QueueOverflow { message: String },

    #[error("remote handler failed: {message}")]
    RemoteException { message: String },

    /// The result for this command fell out of the dedup window before the
    /// waiter could observe it, or the command was superseded by a newer
    /// one for the same method.
    #[error("result for command {id} is no longer available: {message}")]
    Obsolete { id: i64, message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        RpcError::NetworkProblem {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// A waiter's deadline elapsed before command `id` produced a result.
    pub fn timeout(id: i64, timeout_ms: u64) -> Self {
        RpcError::Timeout {
            id,
            message: format!("command {id} timed out after {timeout_ms} ms"),
        }
    }

    /// The peer's queue is at its bound.
    pub fn queue_overflow(peer: &str, bound: usize) -> Self {
        RpcError::QueueOverflow {
            message: format!("queue for peer {peer} is full (bound {bound})"),
        }
    }

    /// The protocol tag this error collapses onto at the wire boundary.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RpcError::Timeout { .. } => FailureKind::Timeout,
            RpcError::NetworkProblem { .. } => FailureKind::NetworkProblem,
            RpcError::QueueOverflow { .. } => FailureKind::QueueOverflow,
            RpcError::RemoteException { .. } => FailureKind::RemoteException,
            RpcError::Obsolete { .. } => FailureKind::Obsolete,
            RpcError::Json { .. } | RpcError::Io { .. } | RpcError::Other(_) => FailureKind::Other,
        }
    }

    /// Whether this failure is attributed to transport or local resource
    /// exhaustion rather than the remote handler. Only these are eligible
    /// for the retry backlog.
    pub fn is_rpc_problem(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. }
                | RpcError::NetworkProblem { .. }
                | RpcError::QueueOverflow { .. }
        )
    }

    /// Reconstruct an error from a wire failure, keeping both the tag and
    /// the human message.
    pub fn from_failure(id: i64, failure: RpcFailure) -> Self {
        match failure.kind {
            FailureKind::Timeout => RpcError::Timeout {
                id,
                message: failure.message,
            },
            FailureKind::NetworkProblem => RpcError::NetworkProblem {
                message: failure.message,
                source: None,
            },
            FailureKind::QueueOverflow => RpcError::QueueOverflow {
                message: failure.message,
            },
            FailureKind::RemoteException => RpcError::RemoteException {
                message: failure.message,
            },
            FailureKind::Obsolete => RpcError::Obsolete {
                id,
                message: failure.message,
            },
            FailureKind::Other => RpcError::Other(failure.message),
        }
    }

    /// Collapse onto a wire failure, keeping the tag and the display text.
    pub fn to_failure(&self) -> RpcFailure {
        RpcFailure::new(self.failure_kind(), self.to_string())
    }
}

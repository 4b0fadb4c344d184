//! Wire protocol types.
//!
//! JSON over HTTP, two `POST` endpoints:
//!
//! | Endpoint | Request body | Response (2xx) |
//! |---|---|---|
//! | `/push` | `RpcCommand` | `RpcCommandResult` |
//! | `/pull` | `RpcCommandResult` or empty | `RpcCommand` or empty |
//!
//! Field names are part of the contract and pinned with serde renames.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Header carrying the client identifier; read by the default
/// authenticator on the server and set by the default auth installer on
/// the client.
pub const CLIENT_ID_HEADER: &str = "x-tether-client";

/// What the engine does with a command after a transport-class failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Report the failure to the caller and forget the command.
    #[default]
    None,
    /// Keep the command in the durable backlog until it is delivered.
    Retry,
    /// Like `Retry`, but a newer command for the same method replaces a
    /// pending one. For heartbeat-style updates where only the latest
    /// value matters.
    RetryWhenOnline,
}

/// Failure taxonomy. Exactly one tag per failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The waiter's deadline elapsed.
    Timeout,
    /// The peer queue is over its bound.
    QueueOverflow,
    /// The remote handler ran and failed. Never retried.
    RemoteException,
    /// The transport could not reach the peer.
    NetworkProblem,
    /// The result is gone from the dedup window, or the command was
    /// superseded.
    Obsolete,
    /// Everything else: malformed bodies, unknown methods, shutdown.
    Other,
}

impl FailureKind {
    /// Transport or local resource exhaustion, as opposed to a
    /// remote-side exception. Only these are retry eligible.
    pub fn is_rpc_problem(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::NetworkProblem | FailureKind::QueueOverflow
        )
    }
}

/// A failure carried inside a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFailure {
    #[serde(rename = "Type")]
    pub kind: FailureKind,
    #[serde(rename = "Message")]
    pub message: String,
}

impl RpcFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A single request for a remote method invocation.
///
/// IDs increase monotonically per originator. Arguments are an ordered
/// list of opaque JSON values so the dispatcher can pull each by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCommand {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "MethodName")]
    pub method_name: String,
    #[serde(rename = "MethodParameters", default)]
    pub method_parameters: Vec<serde_json::Value>,
    #[serde(rename = "RetryStrategy", default)]
    pub retry_strategy: RetryStrategy,
    #[serde(rename = "TimeoutMs")]
    pub timeout_ms: u64,
}

impl RpcCommand {
    /// Positional argument by index, if present.
    pub fn parameter(&self, index: usize) -> Option<&serde_json::Value> {
        self.method_parameters.get(index)
    }
}

/// Outcome of one command. Exactly one of `return_value` / `failure` is
/// set; construct through [`RpcCommandResult::success`] and
/// [`RpcCommandResult::failure`] to keep that invariant.
///
/// Equality is over wire content only; the local completion instant is
/// metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCommandResult {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "ReturnValue", default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(rename = "Failure", default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RpcFailure>,
    /// Local completion instant; not part of the wire contract.
    #[serde(skip)]
    pub completed_at: Option<SystemTime>,
}

impl PartialEq for RpcCommandResult {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.success == other.success
            && self.return_value == other.return_value
            && self.failure == other.failure
    }
}

impl RpcCommandResult {
    pub fn success(id: i64, return_value: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            return_value: Some(return_value),
            failure: None,
            completed_at: Some(SystemTime::now()),
        }
    }

    pub fn failure(id: i64, failure: RpcFailure) -> Self {
        Self {
            id,
            success: false,
            return_value: None,
            failure: Some(failure),
            completed_at: Some(SystemTime::now()),
        }
    }

    /// Convert into what the waiting caller sees.
    pub fn into_outcome(self) -> crate::Result<serde_json::Value> {
        if self.success {
            Ok(self.return_value.unwrap_or(serde_json::Value::Null))
        } else {
            let failure = self
                .failure
                .unwrap_or_else(|| RpcFailure::new(FailureKind::Other, "missing failure detail"));
            Err(crate::RpcError::from_failure(self.id, failure))
        }
    }
}

/// Transient frame pairing a command delivery with a result report, for
/// hosts that carry both directions in one envelope. The two `POST`
/// endpoints exchange the bare halves.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(rename = "Command", default, skip_serializing_if = "Option::is_none")]
    pub command: Option<RpcCommand>,
    #[serde(rename = "Result", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcCommandResult>,
}

impl RpcMessage {
    pub fn command(command: RpcCommand) -> Self {
        Self {
            command: Some(command),
            result: None,
        }
    }

    pub fn result(result: RpcCommandResult) -> Self {
        Self {
            command: None,
            result: Some(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_serialization_roundtrip() {
        let command = RpcCommand {
            id: 1,
            method_name: "AddNumbers".to_string(),
            method_parameters: vec![json!(2), json!(3)],
            retry_strategy: RetryStrategy::Retry,
            timeout_ms: 30_000,
        };

        let encoded = serde_json::to_string(&command).unwrap();
        assert!(encoded.contains("\"ID\":1"));
        assert!(encoded.contains("\"MethodName\":\"AddNumbers\""));
        assert!(encoded.contains("\"MethodParameters\":[2,3]"));
        assert!(encoded.contains("\"RetryStrategy\":\"Retry\""));
        assert!(encoded.contains("\"TimeoutMs\":30000"));

        let decoded: RpcCommand = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_result_serialization_success() {
        let result = RpcCommandResult::success(1, json!(5));
        let encoded = serde_json::to_string(&result).unwrap();

        assert!(encoded.contains("\"Success\":true"));
        assert!(encoded.contains("\"ReturnValue\":5"));
        assert!(!encoded.contains("\"Failure\""));

        let decoded: RpcCommandResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, 1);
        assert!(decoded.success);
        assert_eq!(decoded.return_value, Some(json!(5)));
        assert!(decoded.failure.is_none());
    }

    #[test]
    fn test_result_serialization_failure() {
        let result = RpcCommandResult::failure(
            2,
            RpcFailure::new(FailureKind::RemoteException, "divide by zero"),
        );
        let encoded = serde_json::to_string(&result).unwrap();

        assert!(encoded.contains("\"Success\":false"));
        assert!(encoded.contains("\"Type\":\"RemoteException\""));
        assert!(!encoded.contains("\"ReturnValue\""));

        let decoded: RpcCommandResult = serde_json::from_str(&encoded).unwrap();
        assert!(!decoded.success);
        assert_eq!(
            decoded.failure.unwrap().kind,
            FailureKind::RemoteException
        );
    }

    #[test]
    fn test_result_exactly_one_side_set() {
        let ok = RpcCommandResult::success(1, json!(null));
        assert!(ok.return_value.is_some() && ok.failure.is_none());

        let err = RpcCommandResult::failure(1, RpcFailure::new(FailureKind::Other, "x"));
        assert!(err.return_value.is_none() && err.failure.is_some());
    }

    #[test]
    fn test_into_outcome() {
        let value = RpcCommandResult::success(1, json!(5)).into_outcome().unwrap();
        assert_eq!(value, json!(5));

        let err = RpcCommandResult::failure(
            2,
            RpcFailure::new(FailureKind::Timeout, "deadline elapsed"),
        )
        .into_outcome()
        .unwrap_err();
        assert!(err.is_rpc_problem());
    }

    #[test]
    fn test_message_roundtrip_with_nulls() {
        let frame = RpcMessage::result(RpcCommandResult::success(9, json!("ok")));
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(!encoded.contains("\"Command\""));

        let decoded: RpcMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, frame);

        let empty: RpcMessage = serde_json::from_str("{}").unwrap();
        assert!(empty.command.is_none() && empty.result.is_none());
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let decoded: RpcCommand = serde_json::from_str(
            r#"{"ID": 4, "MethodName": "Ping", "TimeoutMs": 1000}"#,
        )
        .unwrap();
        assert!(decoded.method_parameters.is_empty());
        assert_eq!(decoded.retry_strategy, RetryStrategy::None);
    }
}

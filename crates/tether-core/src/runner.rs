//! Command execution against user handlers.
//!
//! The runner is the only place user code runs. It consults the peer's
//! result window first, so a command id is executed at most once no
//! matter how many duplicate deliveries the transport produces.

use crate::peer::PeerCache;
use crate::protocol::{FailureKind, RpcCommand, RpcCommandResult, RpcFailure};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// A set of methods a host exposes to its peer.
///
/// `execute` returns `None` when the command's method is not one of this
/// handler's, letting the runner try the next registered handler. A
/// returned `Err` means the method ran and failed; it surfaces to the
/// remote caller as a `RemoteException` and is never retried.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn execute(&self, command: &RpcCommand) -> Option<Result<serde_json::Value>>;
}

/// Dispatches commands to the first handler that recognises the method
/// name, in registration order.
#[derive(Clone)]
pub struct CommandRunner {
    handlers: Arc<Vec<Arc<dyn RpcHandler>>>,
}

impl CommandRunner {
    pub fn new(handlers: Vec<Arc<dyn RpcHandler>>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Execute `command` on behalf of the peer owning `cache`, or replay
    /// the cached result of a previous execution with the same id.
    pub async fn run(&self, cache: &PeerCache, command: &RpcCommand) -> RpcCommandResult {
        if let Some(prior) = cache.cached_result(command.id) {
            debug!(
                id = command.id,
                method = %command.method_name,
                "replaying cached result for duplicate delivery"
            );
            return prior;
        }

        // Executed once already, but the result aged out of the window.
        // Re-running would break at-most-once; answer with Obsolete.
        if cache.result_evicted(command.id) {
            warn!(
                id = command.id,
                method = %command.method_name,
                "result evicted before duplicate delivery arrived"
            );
            let result = RpcCommandResult::failure(
                command.id,
                RpcFailure::new(
                    FailureKind::Obsolete,
                    "result no longer cached for replayed command",
                ),
            );
            cache.cache_result(result.clone());
            return result;
        }

        let mut outcome: Option<Result<serde_json::Value>> = None;
        for handler in self.handlers.iter() {
            if let Some(found) = handler.execute(command).await {
                outcome = Some(found);
                break;
            }
        }

        let result = match outcome {
            Some(Ok(value)) => RpcCommandResult::success(command.id, value),
            Some(Err(e)) => {
                warn!(
                    id = command.id,
                    method = %command.method_name,
                    error = %e,
                    "handler failed"
                );
                RpcCommandResult::failure(
                    command.id,
                    RpcFailure::new(FailureKind::RemoteException, e.to_string()),
                )
            }
            None => {
                warn!(id = command.id, method = %command.method_name, "method not found");
                RpcCommandResult::failure(
                    command.id,
                    RpcFailure::new(
                        FailureKind::Other,
                        format!("method not found: {}", command.method_name),
                    ),
                )
            }
        };

        cache.cache_result(result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::protocol::RetryStrategy;
    use crate::RpcError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingAdd {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl RpcHandler for CountingAdd {
        async fn execute(&self, command: &RpcCommand) -> Option<Result<serde_json::Value>> {
            match command.method_name.as_str() {
                "AddNumbers" => {
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    let a = command.parameter(0).and_then(|v| v.as_i64()).unwrap_or(0);
                    let b = command.parameter(1).and_then(|v| v.as_i64()).unwrap_or(0);
                    Some(Ok(json!(a + b)))
                }
                "Explode" => Some(Err(RpcError::Other("boom".into()))),
                _ => None,
            }
        }
    }

    struct ShadowingAdd;

    #[async_trait::async_trait]
    impl RpcHandler for ShadowingAdd {
        async fn execute(&self, command: &RpcCommand) -> Option<Result<serde_json::Value>> {
            (command.method_name == "AddNumbers").then(|| Ok(json!("shadowed")))
        }
    }

    fn command(id: i64, method: &str, params: Vec<serde_json::Value>) -> RpcCommand {
        RpcCommand {
            id,
            method_name: method.to_string(),
            method_parameters: params,
            retry_strategy: RetryStrategy::None,
            timeout_ms: 1_000,
        }
    }

    fn cache() -> PeerCache {
        PeerCache::new(
            Some("c1".into()),
            &EngineConfig::new().with_queue_bound(2).with_result_window(2),
        )
    }

    #[tokio::test]
    async fn test_dispatch_and_success_result() {
        let runner = CommandRunner::new(vec![Arc::new(CountingAdd {
            calls: AtomicU32::new(0),
        })]);
        let cache = cache();

        let result = runner.run(&cache, &command(1, "AddNumbers", vec![json!(2), json!(3)])).await;
        assert!(result.success);
        assert_eq!(result.return_value, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_executes_once() {
        let handler = Arc::new(CountingAdd {
            calls: AtomicU32::new(0),
        });
        let runner = CommandRunner::new(vec![Arc::clone(&handler) as Arc<dyn RpcHandler>]);
        let cache = cache();
        let cmd = command(3, "AddNumbers", vec![json!(1), json!(1)]);

        let first = runner.run(&cache, &cmd).await;
        let second = runner.run(&cache, &cmd).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_remote_exception() {
        let runner = CommandRunner::new(vec![Arc::new(CountingAdd {
            calls: AtomicU32::new(0),
        })]);
        let cache = cache();

        let result = runner.run(&cache, &command(2, "Explode", vec![])).await;
        assert!(!result.success);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::RemoteException);
        assert!(failure.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let runner = CommandRunner::new(vec![Arc::new(CountingAdd {
            calls: AtomicU32::new(0),
        })]);
        let cache = cache();

        let result = runner.run(&cache, &command(4, "NoSuchMethod", vec![])).await;
        assert!(!result.success);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Other);
        assert!(failure.message.contains("method not found"));
    }

    #[tokio::test]
    async fn test_first_match_in_registration_order() {
        let counting = Arc::new(CountingAdd {
            calls: AtomicU32::new(0),
        });
        let runner = CommandRunner::new(vec![
            Arc::new(ShadowingAdd) as Arc<dyn RpcHandler>,
            Arc::clone(&counting) as Arc<dyn RpcHandler>,
        ]);
        let cache = cache();

        let result = runner.run(&cache, &command(5, "AddNumbers", vec![])).await;
        assert_eq!(result.return_value, Some(json!("shadowed")));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_evicted_replay_is_obsolete_not_rerun() {
        let handler = Arc::new(CountingAdd {
            calls: AtomicU32::new(0),
        });
        let runner = CommandRunner::new(vec![Arc::clone(&handler) as Arc<dyn RpcHandler>]);
        let cache = cache(); // window capacity 2

        for id in 1..=3 {
            runner
                .run(&cache, &command(id, "AddNumbers", vec![json!(id), json!(0)]))
                .await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        // Id 1 has been evicted by ids 2 and 3; its replay must not run
        // the handler again.
        let replay = runner
            .run(&cache, &command(1, "AddNumbers", vec![json!(1), json!(0)]))
            .await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(replay.failure.unwrap().kind, FailureKind::Obsolete);
    }
}

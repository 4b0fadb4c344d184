//! Server half of the engine.
//!
//! One instance per process. The server never dials a client: its
//! outbound commands sit in that client's `PeerCache` until the client's
//! next `/pull` picks them up, and each `/pull` request doubles as the
//! delivery channel for the previous command's result.
//!
//! The HTTP layer stays outside this crate; hosts route `POST /push` to
//! [`ServerEngine::handle_push`] and `POST /pull` to
//! [`ServerEngine::handle_pull`] after authenticating the request to a
//! client id.

use crate::command::PendingCommand;
use crate::config::EngineConfig;
use crate::peer::PeerCache;
use crate::protocol::{FailureKind, RetryStrategy, RpcCommand, RpcCommandResult, RpcFailure};
use crate::runner::{CommandRunner, RpcHandler};
use crate::{Result, RpcError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// The server engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ServerEngine {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: EngineConfig,
    runner: CommandRunner,
    peers: Mutex<HashMap<String, Arc<PeerCache>>>,
    next_id: AtomicI64,
}

impl ServerEngine {
    pub fn new(config: EngineConfig, handlers: Vec<Arc<dyn RpcHandler>>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                runner: CommandRunner::new(handlers),
                peers: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
            }),
        }
    }

    /// The cache for `client_id`, created on first contact.
    fn peer(&self, client_id: &str) -> Arc<PeerCache> {
        let mut peers = self.inner.peers.lock().unwrap();
        match peers.get(client_id) {
            Some(peer) => Arc::clone(peer),
            None => {
                info!(client_id, "first contact from client");
                let peer = Arc::new(PeerCache::new(
                    Some(client_id.to_string()),
                    &self.inner.config,
                ));
                peers.insert(client_id.to_string(), Arc::clone(&peer));
                peer
            }
        }
    }

    /// Client ids seen so far.
    pub fn client_ids(&self) -> Vec<String> {
        self.inner.peers.lock().unwrap().keys().cloned().collect()
    }

    /// Execute a client-originated command and produce its result.
    /// Replayed deliveries of the same id are answered from the client's
    /// result window without re-running the handler.
    pub async fn handle_push(&self, client_id: &str, command: RpcCommand) -> RpcCommandResult {
        debug!(client_id, id = command.id, method = %command.method_name, "push");
        let peer = self.peer(client_id);
        self.inner.runner.run(&peer, &command).await
    }

    /// One long-poll exchange with `client_id`.
    ///
    /// A non-empty `previous` first completes the head of that client's
    /// queue (id-matched, so duplicate reports fall through; a head whose
    /// waiter already timed out is advanced past all the same). The call
    /// then blocks up to the long-poll window for the next command;
    /// `None` means "nothing yet", which the host answers with an empty
    /// 2xx body.
    pub async fn handle_pull(
        &self,
        client_id: &str,
        previous: Option<RpcCommandResult>,
    ) -> Option<RpcCommand> {
        let peer = self.peer(client_id);
        if let Some(result) = previous {
            debug!(client_id, id = result.id, "pull carried a result report");
            peer.finish_head_result(result);
        }

        let pending = peer.current_command(Some(self.inner.config.long_poll)).await?;
        pending.mark_sent();
        debug!(
            client_id,
            id = pending.command.id,
            method = %pending.command.method_name,
            "delivering command via pull"
        );
        Some(pending.command.clone())
    }

    /// Invoke `method` on a connected client with the engine's default
    /// timeout.
    pub async fn execute_on_client(
        &self,
        client_id: &str,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.execute_on_client_with(client_id, method, params, None)
            .await
    }

    /// Invoke `method` on a connected client, awaiting the result up to
    /// `timeout_ms`. The command is delivered on the client's next pull;
    /// expiry leaves it queued (delivery cannot be cancelled remotely).
    pub async fn execute_on_client_with(
        &self,
        client_id: &str,
        method: &str,
        params: Vec<serde_json::Value>,
        timeout_ms: Option<u64>,
    ) -> Result<serde_json::Value> {
        let timeout_ms = timeout_ms.unwrap_or(self.inner.config.default_timeout_ms);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let command = RpcCommand {
            id,
            method_name: method.to_string(),
            method_parameters: params,
            retry_strategy: RetryStrategy::None,
            timeout_ms,
        };

        let peer = self.peer(client_id);
        let (pending, done) = PendingCommand::new(command);
        peer.enqueue(Arc::clone(&pending))?;

        match tokio::time::timeout(Duration::from_millis(timeout_ms), done).await {
            Err(_elapsed) => {
                pending.force_fail(RpcFailure::new(
                    FailureKind::Timeout,
                    format!("no result within {timeout_ms} ms"),
                ));
                Err(RpcError::timeout(id, timeout_ms))
            }
            Ok(Err(_closed)) => Err(RpcError::Other("shutdown".to_string())),
            Ok(Ok(result)) => result.into_outcome(),
        }
    }

    /// Complete every queued command on every peer with
    /// `Other("shutdown")`.
    pub fn stop(&self) {
        let peers: Vec<_> = {
            let peers = self.inner.peers.lock().unwrap();
            peers.values().cloned().collect()
        };
        for peer in peers {
            peer.drain_with_failure(RpcFailure::new(FailureKind::Other, "shutdown"));
        }
        info!("server engine stopped");
    }
}

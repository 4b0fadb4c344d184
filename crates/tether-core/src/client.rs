//! Client half of the engine.
//!
//! The client owns every TCP connection. Two persistent loops run against
//! the server: the push loop delivers locally-originated commands through
//! `POST /push`, the pull loop long-polls `POST /pull` for server-
//! originated commands and reports each execution's result on its next
//! iteration. Neither loop ever propagates an error; they log, back off
//! and retry.
//!
//! # Thread safety
//!
//! `ClientEngine` is a cheap handle around shared state; clone it freely.
//! The `reqwest::Client` is shared by both loops (documented thread-safe).

use crate::backlog::CommandBacklog;
use crate::command::PendingCommand;
use crate::config::EngineConfig;
use crate::peer::PeerCache;
use crate::protocol::{
    FailureKind, RetryStrategy, RpcCommand, RpcCommandResult, RpcFailure, CLIENT_ID_HEADER,
};
use crate::runner::{CommandRunner, RpcHandler};
use crate::{Result, RpcError};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Identity and address of one client deployment. Immutable after
/// `start`.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Unique id of this client within the deployment.
    pub client_id: String,
    /// Base URL of the server, e.g. `http://127.0.0.1:4000`.
    pub server_url: String,
}

impl RpcClientConfig {
    pub fn new(client_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            server_url: server_url.into(),
        }
    }
}

/// Installs credentials on every outgoing request.
pub type AuthInstaller =
    Arc<dyn Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync>;

/// Builder for [`ClientEngine`].
pub struct ClientEngineBuilder {
    config: RpcClientConfig,
    engine_config: EngineConfig,
    handlers: Vec<Arc<dyn RpcHandler>>,
    auth: Option<AuthInstaller>,
    backlog: Option<Arc<dyn CommandBacklog>>,
}

impl ClientEngineBuilder {
    /// Register a handler for commands the server executes on this
    /// client. Dispatch is first-match in registration order.
    pub fn handler(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Replace the default header-based credential installer.
    pub fn auth_installer(mut self, auth: AuthInstaller) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Attach a durable retry backlog.
    pub fn backlog(mut self, backlog: Arc<dyn CommandBacklog>) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn engine_config(mut self, engine_config: EngineConfig) -> Self {
        self.engine_config = engine_config;
        self
    }

    pub fn build(self) -> ClientEngine {
        let auth = self.auth.unwrap_or_else(|| {
            let client_id = self.config.client_id.clone();
            Arc::new(move |request: reqwest::RequestBuilder| {
                request.header(CLIENT_ID_HEADER, client_id.clone())
            })
        });
        let (shutdown, _) = watch::channel(false);
        ClientEngine {
            inner: Arc::new(ClientInner {
                server: Arc::new(PeerCache::new(None, &self.engine_config)),
                runner: CommandRunner::new(self.handlers),
                config: self.config,
                engine_config: self.engine_config,
                backlog: self.backlog,
                auth,
                shutdown,
                started: AtomicBool::new(false),
                next_id: AtomicI64::new(1),
            }),
        }
    }
}

/// The client engine. One per process and server.
#[derive(Clone)]
pub struct ClientEngine {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: RpcClientConfig,
    engine_config: EngineConfig,
    server: Arc<PeerCache>,
    runner: CommandRunner,
    backlog: Option<Arc<dyn CommandBacklog>>,
    auth: AuthInstaller,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    next_id: AtomicI64,
}

impl ClientEngine {
    pub fn builder(config: RpcClientConfig) -> ClientEngineBuilder {
        ClientEngineBuilder {
            config,
            engine_config: EngineConfig::default(),
            handlers: Vec::new(),
            auth: None,
            backlog: None,
        }
    }

    /// Start the push and pull loops. Idempotent; the second and later
    /// calls are no-ops.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("client engine already started");
            return Ok(());
        }

        let http = match reqwest::Client::builder()
            .timeout(self.inner.engine_config.http_timeout())
            .build()
        {
            Ok(http) => http,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        self.inner.flush_backlog_into_queue();

        tokio::spawn(push_loop(
            Arc::clone(&self.inner),
            http.clone(),
            self.inner.shutdown.subscribe(),
        ));
        tokio::spawn(pull_loop(
            Arc::clone(&self.inner),
            http,
            self.inner.shutdown.subscribe(),
        ));

        info!(
            client_id = %self.inner.config.client_id,
            server = %self.inner.config.server_url,
            "client engine started"
        );
        Ok(())
    }

    /// Invoke `method` on the server with the engine's default timeout and
    /// no retry.
    pub async fn execute_on_server(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.execute_on_server_with(method, params, None, RetryStrategy::None)
            .await
    }

    /// Invoke `method` on the server.
    ///
    /// Enqueues the command and awaits its result up to `timeout_ms`
    /// (engine default when `None`). On a transport-class failure with a
    /// strategy other than `None`, the command is parked in the backlog
    /// before the error is returned: the caller learns immediately while
    /// delivery continues in the background.
    pub async fn execute_on_server_with(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
        timeout_ms: Option<u64>,
        strategy: RetryStrategy,
    ) -> Result<serde_json::Value> {
        let inner = &self.inner;
        let timeout_ms = timeout_ms.unwrap_or(inner.engine_config.default_timeout_ms);
        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let command = RpcCommand {
            id,
            method_name: method.to_string(),
            method_parameters: params,
            retry_strategy: strategy,
            timeout_ms,
        };

        let (pending, done) = PendingCommand::new(command.clone());
        let outcome = match inner.server.enqueue(Arc::clone(&pending)) {
            Err(e) => Err(e),
            Ok(()) => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), done).await {
                    Err(_elapsed) => {
                        // The command stays queued and may still execute
                        // remotely; its terminal state absorbs that result.
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
        };

        if let Err(e) = &outcome {
            if e.is_rpc_problem() && strategy != RetryStrategy::None {
                if let Some(backlog) = &inner.backlog {
                    debug!(id, error = %e, "parking command in retry backlog");
                    if let Err(be) = backlog.enqueue(None, &command) {
                        warn!(id, error = %be, "failed to persist command to backlog");
                    }
                    inner.flush_backlog_into_queue();
                }
            }
        }
        outcome
    }

    /// Number of commands currently queued for the server.
    pub fn pending_commands(&self) -> usize {
        self.inner.server.len()
    }

    /// Signal shutdown. Loops exit at their next iteration boundary;
    /// queued commands complete their waiters with `Other("shutdown")`.
    pub fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner
            .server
            .drain_with_failure(RpcFailure::new(FailureKind::Other, "shutdown"));
        info!(client_id = %self.inner.config.client_id, "client engine stopped");
    }
}

impl ClientInner {
    /// Move backlog entries into the live queue, oldest first, skipping
    /// ones already queued. Called at start and whenever queue space may
    /// have opened up; entries that do not fit stay in the backlog.
    fn flush_backlog_into_queue(&self) {
        let Some(backlog) = &self.backlog else {
            return;
        };
        let mut max_id = 0;
        for command in backlog.peek_all(None) {
            max_id = max_id.max(command.id);
            if self.server.contains(command.id) {
                continue;
            }
            let id = command.id;
            if let Err(e) = self.server.enqueue(PendingCommand::detached(command)) {
                debug!(id, error = %e, "backlog entry does not fit the queue yet");
                break;
            }
            debug!(id, "restored command from backlog");
        }
        // Ids restored from a previous run must not be reissued.
        self.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
    }

    async fn execute_locally_now(&self, command: &RpcCommand) -> RpcCommandResult {
        self.runner.run(&self.server, command).await
    }
}

/// Multiply `base` by a random factor in [0.5, 1.5) so simultaneous
/// clients do not retry in lockstep.
fn jittered(base: Duration) -> Duration {
    let mut rng = rand::rng();
    base.mul_f64(rng.random_range(0.5..1.5))
}

/// Deliver locally-originated commands to the server, one at a time.
///
/// A transport failure leaves the head in place; the retry re-sends the
/// same command, which the server deduplicates by id.
async fn push_loop(
    inner: Arc<ClientInner>,
    http: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = format!("{}/push", inner.config.server_url.trim_end_matches('/'));
    loop {
        if *shutdown.borrow() {
            break;
        }
        let pending = tokio::select! {
            _ = shutdown.changed() => break,
            head = inner.server.current_command(None) => match head {
                Some(head) => head,
                None => continue,
            },
        };

        pending.mark_sent();
        let response = (inner.auth)(http.post(&url))
            .json(&pending.command)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<RpcCommandResult>().await {
                    Ok(result) => {
                        let id = pending.command.id;
                        debug!(id, success = result.success, "push completed");
                        pending.finish(result);
                        inner.server.finish_current_command(id);
                        if pending.command.retry_strategy != RetryStrategy::None {
                            if let Some(backlog) = &inner.backlog {
                                if let Err(e) = backlog.remove(None, id) {
                                    warn!(id, error = %e, "failed to drop delivered command from backlog");
                                }
                            }
                        }
                        inner.flush_backlog_into_queue();
                    }
                    Err(e) => {
                        warn!(id = pending.command.id, error = %e, "push response malformed, retrying");
                        tokio::time::sleep(jittered(inner.engine_config.transport_backoff)).await;
                    }
                }
            }
            Ok(response) => {
                warn!(
                    id = pending.command.id,
                    status = %response.status(),
                    "push rejected, retrying"
                );
                tokio::time::sleep(jittered(inner.engine_config.transport_backoff)).await;
            }
            Err(e) => {
                debug!(id = pending.command.id, error = %e, "push transport failure, retrying");
                tokio::time::sleep(jittered(inner.engine_config.transport_backoff)).await;
            }
        }
    }
    debug!("push loop exited");
}

/// Long-poll the server for commands to execute locally.
///
/// Each request carries the previous execution's result; a transport
/// failure retries with the same result so the server can deduplicate the
/// report by id.
async fn pull_loop(
    inner: Arc<ClientInner>,
    http: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = format!("{}/pull", inner.config.server_url.trim_end_matches('/'));
    let mut last_result: Option<RpcCommandResult> = None;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut request = (inner.auth)(http.post(&url));
        if let Some(result) = &last_result {
            request = request.json(result);
        }

        let response = tokio::select! {
            _ = shutdown.changed() => break,
            response = request.send() => response,
        };

        match response {
            Ok(response) if response.status().is_success() => match response.bytes().await {
                Ok(body) if body.is_empty() => {
                    // Nothing for us within the long-poll window; the
                    // previous result (if any) has been consumed.
                    last_result = None;
                }
                Ok(body) => match serde_json::from_slice::<RpcCommand>(&body) {
                    Ok(command) => {
                        debug!(id = command.id, method = %command.method_name, "pulled command");
                        last_result = Some(inner.execute_locally_now(&command).await);
                    }
                    Err(e) => {
                        warn!(error = %e, "pull response malformed");
                        last_result = None;
                        tokio::time::sleep(jittered(inner.engine_config.transport_backoff)).await;
                    }
                },
                Err(e) => {
                    debug!(error = %e, "pull body read failed, retrying with same report");
                    tokio::time::sleep(jittered(inner.engine_config.transport_backoff)).await;
                }
            },
            Ok(response) => {
                warn!(status = %response.status(), "pull rejected, retrying with same report");
                tokio::time::sleep(jittered(inner.engine_config.transport_backoff)).await;
            }
            Err(e) => {
                debug!(error = %e, "pull transport failure, retrying with same report");
                tokio::time::sleep(jittered(inner.engine_config.transport_backoff)).await;
            }
        }
    }
    debug!("pull loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::MemoryBacklog;

    fn unreachable_engine(backlog: Option<Arc<dyn CommandBacklog>>) -> ClientEngine {
        // Port 9 (discard) is never bound in the test environment, so
        // pushes fail fast with connection refused.
        let mut builder = ClientEngine::builder(RpcClientConfig::new(
            "c-test",
            "http://127.0.0.1:9",
        ))
        .engine_config(
            EngineConfig::new()
                .with_long_poll(Duration::from_millis(100))
                .with_transport_backoff(Duration::from_millis(20))
                .with_default_timeout_ms(100),
        );
        if let Some(backlog) = backlog {
            builder = builder.backlog(backlog);
        }
        builder.build()
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let engine = unreachable_engine(None);
        engine.start().unwrap();
        engine.start().unwrap();
        engine.stop();
    }

    #[tokio::test]
    async fn test_timeout_with_none_strategy_is_not_backlogged() {
        let backlog: Arc<MemoryBacklog> = Arc::new(MemoryBacklog::new());
        let engine = unreachable_engine(Some(Arc::clone(&backlog) as Arc<dyn CommandBacklog>));
        engine.start().unwrap();

        let err = engine
            .execute_on_server_with("Ping", vec![], Some(50), RetryStrategy::None)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(backlog.peek_all(None).is_empty());

        engine.stop();
    }

    #[tokio::test]
    async fn test_rpc_problem_with_retry_strategy_is_backlogged() {
        let backlog: Arc<MemoryBacklog> = Arc::new(MemoryBacklog::new());
        let engine = unreachable_engine(Some(Arc::clone(&backlog) as Arc<dyn CommandBacklog>));
        engine.start().unwrap();

        let err = engine
            .execute_on_server_with("Transfer", vec![serde_json::json!(10)], Some(50), RetryStrategy::Retry)
            .await
            .unwrap_err();
        assert!(err.is_rpc_problem());

        let parked = backlog.peek_all(None);
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].method_name, "Transfer");

        engine.stop();
    }

    #[tokio::test]
    async fn test_retry_when_online_keeps_only_latest_heartbeat() {
        let backlog: Arc<MemoryBacklog> = Arc::new(MemoryBacklog::new());
        let engine = unreachable_engine(Some(Arc::clone(&backlog) as Arc<dyn CommandBacklog>));
        engine.start().unwrap();

        for beat in 1..=3 {
            let _ = engine
                .execute_on_server_with(
                    "Heartbeat",
                    vec![serde_json::json!(beat)],
                    Some(50),
                    RetryStrategy::RetryWhenOnline,
                )
                .await;
        }

        let parked = backlog.peek_all(None);
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].method_parameters, vec![serde_json::json!(3)]);
        // The live queue was collapsed the same way.
        assert_eq!(engine.pending_commands(), 1);

        engine.stop();
    }

    #[tokio::test]
    async fn test_start_restores_backlog_and_advances_ids() {
        let backlog: Arc<MemoryBacklog> = Arc::new(MemoryBacklog::new());
        for id in [5, 6] {
            backlog
                .enqueue(
                    None,
                    &RpcCommand {
                        id,
                        method_name: "Transfer".to_string(),
                        method_parameters: vec![],
                        retry_strategy: RetryStrategy::Retry,
                        timeout_ms: 1_000,
                    },
                )
                .unwrap();
        }

        let engine = unreachable_engine(Some(Arc::clone(&backlog) as Arc<dyn CommandBacklog>));
        engine.start().unwrap();
        assert_eq!(engine.pending_commands(), 2);

        // A fresh command must not collide with the restored ids.
        let err = engine
            .execute_on_server_with("Ping", vec![], Some(50), RetryStrategy::None)
            .await
            .unwrap_err();
        match err {
            RpcError::Timeout { id, .. } => assert!(id > 6),
            other => panic!("expected timeout, got {other:?}"),
        }

        engine.stop();
    }

    #[tokio::test]
    async fn test_stop_completes_waiters_with_shutdown() {
        let engine = unreachable_engine(None);
        engine.start().unwrap();

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute_on_server_with("Ping", vec![], Some(10_000), RetryStrategy::None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("shutdown"));
    }
}

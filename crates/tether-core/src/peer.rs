//! Per-peer command queue and recent-result window.
//!
//! One `PeerCache` exists per remote peer: on a client there is exactly
//! one (directed at the server, peer id `None`), on the server one per
//! client id. It buffers that peer's outbound commands behind a stable
//! head, and remembers the results of commands *executed locally on that
//! peer's behalf* so retried deliveries are answered without re-running
//! user code.
//!
//! The head is read without being dequeued: a delivery whose response is
//! lost to the network must find the same command at the head on the next
//! attempt. Only an id-matched finish advances the queue.

use crate::command::PendingCommand;
use crate::config::EngineConfig;
use crate::protocol::{FailureKind, RetryStrategy, RpcCommandResult, RpcFailure};
use crate::{Result, RpcError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Bounded window of recent results keyed by command id, plus the highest
/// id whose execution completed. Eviction is oldest-first; the watermark
/// lets replays of evicted ids be recognised instead of re-executed.
#[derive(Debug)]
struct ResultWindow {
    capacity: usize,
    order: VecDeque<i64>,
    entries: HashMap<i64, RpcCommandResult>,
    watermark: i64,
}

impl ResultWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
            watermark: 0,
        }
    }

    fn insert(&mut self, result: RpcCommandResult) {
        let id = result.id;
        self.watermark = self.watermark.max(id);
        if self.entries.insert(id, result).is_none() {
            self.order.push_back(id);
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    fn get(&self, id: i64) -> Option<RpcCommandResult> {
        self.entries.get(&id).cloned()
    }

    fn is_evicted(&self, id: i64) -> bool {
        id > 0 && id <= self.watermark && !self.entries.contains_key(&id)
    }
}

#[derive(Debug)]
struct CacheState {
    queue: VecDeque<Arc<PendingCommand>>,
    results: ResultWindow,
}

/// Queue-plus-dedup structure for one remote peer.
#[derive(Debug)]
pub struct PeerCache {
    /// `None` means "the server" (the client's single remote peer).
    peer_id: Option<String>,
    queue_bound: usize,
    state: Mutex<CacheState>,
    available: Notify,
}

impl PeerCache {
    pub fn new(peer_id: Option<String>, config: &EngineConfig) -> Self {
        Self {
            peer_id,
            queue_bound: config.queue_bound,
            state: Mutex::new(CacheState {
                queue: VecDeque::new(),
                results: ResultWindow::new(config.result_window.max(config.queue_bound)),
            }),
            available: Notify::new(),
        }
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    fn peer_label(&self) -> &str {
        self.peer_id.as_deref().unwrap_or("server")
    }

    /// Append a command to the FIFO and wake waiters.
    ///
    /// For `RetryWhenOnline` commands, a queued command for the same
    /// method with the same strategy is superseded first: removed from the
    /// queue and completed with an `Obsolete` failure. Fails with
    /// `QueueOverflow` when the queue is at its bound.
    pub fn enqueue(&self, pending: Arc<PendingCommand>) -> Result<()> {
        let superseded = {
            let mut state = self.state.lock().unwrap();

            let mut superseded = Vec::new();
            if pending.command.retry_strategy == RetryStrategy::RetryWhenOnline {
                state.queue.retain(|queued| {
                    let replace = queued.command.retry_strategy == RetryStrategy::RetryWhenOnline
                        && queued.command.method_name == pending.command.method_name;
                    if replace {
                        superseded.push(Arc::clone(queued));
                    }
                    !replace
                });
            }

            if state.queue.len() >= self.queue_bound {
                return Err(RpcError::queue_overflow(self.peer_label(), self.queue_bound));
            }

            trace!(
                peer = self.peer_label(),
                id = pending.command.id,
                method = %pending.command.method_name,
                "enqueue"
            );
            state.queue.push_back(pending);
            superseded
        };

        for old in superseded {
            debug!(
                peer = self.peer_label(),
                id = old.command.id,
                method = %old.command.method_name,
                "superseded by newer command"
            );
            old.finish(RpcCommandResult::failure(
                old.command.id,
                RpcFailure::new(
                    FailureKind::Obsolete,
                    format!("superseded by a newer {} command", old.command.method_name),
                ),
            ));
        }

        // notify_one stores a permit when nobody is waiting yet, so a
        // reader that checked the queue just before this enqueue still
        // wakes up.
        self.available.notify_one();
        Ok(())
    }

    /// Return the head of the queue without dequeuing it, waiting up to
    /// `wait` for one to appear (`None` = forever).
    pub async fn current_command(&self, wait: Option<Duration>) -> Option<Arc<PendingCommand>> {
        let deadline = wait.map(|d| tokio::time::Instant::now() + d);
        loop {
            let notified = self.available.notified();
            if let Some(head) = self.state.lock().unwrap().queue.front().cloned() {
                return Some(head);
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => return None,
                    }
                }
            }
        }
    }

    /// Pop the head, provided it is still the command with `id`. A head
    /// that changed underneath (superseded, already finished by another
    /// path) makes this a no-op.
    pub fn finish_current_command(&self, id: i64) {
        let mut state = self.state.lock().unwrap();
        if state.queue.front().map(|head| head.command.id) == Some(id) {
            state.queue.pop_front();
        }
    }

    /// Deliver a reported result to the head: completes the head's waiter
    /// and pops it whenever the ids match. The head's state is not
    /// consulted: a head force-failed by its waiter's deadline is already
    /// terminal, and the report for it must still advance the queue or
    /// every later command stays blocked behind it (the push path pops by
    /// id alone for the same reason). Duplicate reports after the head
    /// advanced fall through silently.
    pub fn finish_head_result(&self, result: RpcCommandResult) {
        let head = {
            let mut state = self.state.lock().unwrap();
            match state.queue.front() {
                Some(head) if head.command.id == result.id => state.queue.pop_front(),
                _ => None,
            }
        };
        match head {
            Some(head) => {
                head.finish(result);
            }
            None => debug!(
                peer = self.peer_label(),
                id = result.id,
                "ignoring result report that does not match the sent head"
            ),
        }
    }

    /// Record a locally-produced result for replay deduplication.
    pub fn cache_result(&self, result: RpcCommandResult) {
        self.state.lock().unwrap().results.insert(result);
    }

    /// Look up a recent result by command id.
    pub fn cached_result(&self, id: i64) -> Option<RpcCommandResult> {
        self.state.lock().unwrap().results.get(id)
    }

    /// Whether `id` was executed at some point but its result has already
    /// been evicted from the window.
    pub fn result_evicted(&self, id: i64) -> bool {
        self.state.lock().unwrap().results.is_evicted(id)
    }

    /// Whether a command with `id` is currently queued.
    pub fn contains(&self, id: i64) -> bool {
        self.state
            .lock()
            .unwrap()
            .queue
            .iter()
            .any(|pending| pending.command.id == id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the queue, completing every pending command with `failure`.
    /// Used on shutdown.
    pub fn drain_with_failure(&self, failure: RpcFailure) {
        let drained: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.queue.drain(..).collect()
        };
        for pending in drained {
            pending.finish(RpcCommandResult::failure(
                pending.command.id,
                failure.clone(),
            ));
        }
    }
}

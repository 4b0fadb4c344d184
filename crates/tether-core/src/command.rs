//! In-engine command envelope.
//!
//! A [`PendingCommand`] wraps one wire command with its transient state
//! machine and completion channel. The queue, the head-of-queue slot and
//! the awaiting caller all share the same `Arc`.
//!
//! States run `Enqueued → Sent → (Successful | Failed)`; terminal states
//! absorb every later transition attempt, which is what makes duplicate
//! deliveries and late results harmless.

use crate::protocol::{RpcCommand, RpcCommandResult, RpcFailure};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// Lifecycle of a command on its originating side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Enqueued,
    Sent,
    Successful,
    Failed,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Successful | CommandState::Failed)
    }
}

/// A command waiting to be delivered, shared between the peer queue and
/// at most one awaiting caller.
#[derive(Debug)]
pub struct PendingCommand {
    pub command: RpcCommand,
    state: Mutex<CommandState>,
    done: Mutex<Option<oneshot::Sender<RpcCommandResult>>>,
}

impl PendingCommand {
    /// Create an envelope plus the receiver the caller awaits.
    pub fn new(command: RpcCommand) -> (std::sync::Arc<Self>, oneshot::Receiver<RpcCommandResult>) {
        let (tx, rx) = oneshot::channel();
        let pending = std::sync::Arc::new(Self {
            command,
            state: Mutex::new(CommandState::Enqueued),
            done: Mutex::new(Some(tx)),
        });
        (pending, rx)
    }

    /// Create an envelope with no waiter, for commands restored from the
    /// backlog after a restart.
    pub fn detached(command: RpcCommand) -> std::sync::Arc<Self> {
        let (pending, _rx) = Self::new(command);
        pending
    }

    pub fn state(&self) -> CommandState {
        *self.state.lock().unwrap()
    }

    /// First delivery attempt. No-op once the command left `Enqueued`;
    /// retransmissions of the same head keep the `Sent` state.
    pub fn mark_sent(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == CommandState::Enqueued {
            *state = CommandState::Sent;
        }
    }

    /// Complete the command with its result and wake the waiter.
    ///
    /// First writer wins: once terminal, later results are absorbed and
    /// `false` is returned.
    pub fn finish(&self, result: RpcCommandResult) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_terminal() {
                debug!(
                    id = self.command.id,
                    "dropping result for already-completed command"
                );
                return false;
            }
            *state = if result.success {
                CommandState::Successful
            } else {
                CommandState::Failed
            };
        }
        if let Some(tx) = self.done.lock().unwrap().take() {
            // The waiter may be gone (timed out or detached); fine.
            let _ = tx.send(result);
        }
        true
    }

    /// Force the command into `Failed` without a remote response. Used by
    /// the waiter's deadline; the command stays queued and may still
    /// execute remotely, whose result the terminal state then absorbs.
    pub fn force_fail(&self, failure: RpcFailure) -> bool {
        self.finish(RpcCommandResult::failure(self.command.id, failure))
    }
}

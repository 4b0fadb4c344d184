//! Engine configuration.
//!
//! All tunables live here as fields of `EngineConfig`, passed to the
//! engines at construction. Defaults are associated constants so hosts can
//! reference them without building a config.

use std::time::Duration;

/// Tunable parameters shared by both engine halves.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a `/pull` is held open waiting for a command before the
    /// server answers with an empty body.
    pub long_poll: Duration,
    /// Maximum number of pending commands per peer queue.
    pub queue_bound: usize,
    /// Capacity of the per-peer recent-result window used for dedup.
    /// Must be at least `queue_bound`.
    pub result_window: usize,
    /// Default per-command timeout when the caller does not pass one.
    pub default_timeout_ms: u64,
    /// Base delay between transport-failure retries of the client loops.
    pub transport_backoff: Duration,
}

impl EngineConfig {
    pub const DEFAULT_LONG_POLL: Duration = Duration::from_secs(90);
    pub const DEFAULT_QUEUE_BOUND: usize = 10;
    pub const DEFAULT_RESULT_WINDOW: usize = 100;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_TRANSPORT_BACKOFF: Duration = Duration::from_secs(1);

    /// Extra headroom the client HTTP timeout gets on top of the long-poll
    /// window, so an idle poll is answered by the server, not the socket.
    pub const HTTP_TIMEOUT_HEADROOM: Duration = Duration::from_secs(10);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_long_poll(mut self, window: Duration) -> Self {
        self.long_poll = window;
        self
    }

    pub fn with_queue_bound(mut self, bound: usize) -> Self {
        self.queue_bound = bound;
        self
    }

    pub fn with_result_window(mut self, capacity: usize) -> Self {
        self.result_window = capacity;
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_transport_backoff(mut self, backoff: Duration) -> Self {
        self.transport_backoff = backoff;
        self
    }

    /// Timeout for the client's HTTP requests: the long-poll window plus
    /// headroom for the response to travel.
    pub fn http_timeout(&self) -> Duration {
        self.long_poll + Self::HTTP_TIMEOUT_HEADROOM
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            long_poll: Self::DEFAULT_LONG_POLL,
            queue_bound: Self::DEFAULT_QUEUE_BOUND,
            result_window: Self::DEFAULT_RESULT_WINDOW,
            default_timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            transport_backoff: Self::DEFAULT_TRANSPORT_BACKOFF,
        }
    }
}

//! Tether — a bidirectional RPC engine over plain HTTP.
//!
//! A server and a set of firewall-bound clients invoke each other's
//! methods symmetrically, even though clients initiate every TCP
//! connection. Client→server calls travel as `POST /push`; server→client
//! calls ride the long-poll channel: each client keeps a `POST /pull`
//! open, the server holds it until a command is available (or a window
//! elapses), and the client reports the execution result on its next
//! pull.
//!
//! Delivery is at-least-once at the transport (lost responses are
//! retried), and execution is at-most-once at the engine: every peer
//! remembers the results of recent commands by id and replays them for
//! duplicate deliveries instead of re-running user code.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{ClientEngine, RpcClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let engine = ClientEngine::builder(RpcClientConfig::new(
//!         "client-1",
//!         "http://127.0.0.1:4000",
//!     ))
//!     .build();
//!     engine.start()?;
//!
//!     let sum = engine
//!         .execute_on_server("AddNumbers", vec![2.into(), 3.into()])
//!         .await?;
//!     println!("2 + 3 = {sum}");
//!     Ok(())
//! }
//! ```

pub mod backlog;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod runner;
pub mod server;

// Re-export commonly used types
pub use backlog::{CommandBacklog, FileBacklog, MemoryBacklog};
pub use client::{AuthInstaller, ClientEngine, ClientEngineBuilder, RpcClientConfig};
pub use command::{CommandState, PendingCommand};
pub use config::EngineConfig;
pub use error::{Result, RpcError};
pub use peer::PeerCache;
pub use protocol::{
    FailureKind, RetryStrategy, RpcCommand, RpcCommandResult, RpcFailure, RpcMessage,
    CLIENT_ID_HEADER,
};
pub use runner::{CommandRunner, RpcHandler};
pub use server::ServerEngine;

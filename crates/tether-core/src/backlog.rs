//! Durable retry backlog.
//!
//! Commands whose delivery failed with a transport-class error are parked
//! here so they survive a process restart. The engine repopulates its
//! queue from the backlog on start and removes entries once the command
//! was delivered.
//!
//! `FileBacklog` persists to a single JSON file with atomic
//! temp-file-then-rename writes; per-peer enqueue order is the vector
//! order and survives restart.

use crate::protocol::{RetryStrategy, RpcCommand};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Pluggable store for commands awaiting retry.
///
/// `peer_id` is `None` for "the server" (the client engine's single
/// peer). Implementations must preserve per-peer enqueue order and be
/// safe for concurrent use.
pub trait CommandBacklog: Send + Sync + 'static {
    /// Park a command. `RetryWhenOnline` commands replace a pending entry
    /// for the same peer and method; `Retry` commands append (an entry
    /// with the same id is updated in place, not duplicated).
    fn enqueue(&self, peer_id: Option<&str>, command: &RpcCommand) -> Result<()>;

    /// All pending commands for a peer, in enqueue order.
    fn peek_all(&self, peer_id: Option<&str>) -> Vec<RpcCommand>;

    /// Drop a delivered (or abandoned) command.
    fn remove(&self, peer_id: Option<&str>, command_id: i64) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BacklogEntry {
    peer_id: Option<String>,
    command: RpcCommand,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BacklogData {
    entries: Vec<BacklogEntry>,
}

impl BacklogData {
    fn apply_enqueue(&mut self, peer_id: Option<&str>, command: &RpcCommand) {
        if command.retry_strategy == RetryStrategy::RetryWhenOnline {
            // Latest writer wins per (peer, method).
            self.entries.retain(|entry| {
                !(entry.peer_id.as_deref() == peer_id
                    && entry.command.retry_strategy == RetryStrategy::RetryWhenOnline
                    && entry.command.method_name == command.method_name)
            });
        }
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|entry| entry.peer_id.as_deref() == peer_id && entry.command.id == command.id)
        {
            existing.command = command.clone();
        } else {
            self.entries.push(BacklogEntry {
                peer_id: peer_id.map(String::from),
                command: command.clone(),
            });
        }
    }

    fn apply_remove(&mut self, peer_id: Option<&str>, command_id: i64) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !(entry.peer_id.as_deref() == peer_id && entry.command.id == command_id));
        self.entries.len() < before
    }

    fn for_peer(&self, peer_id: Option<&str>) -> Vec<RpcCommand> {
        self.entries
            .iter()
            .filter(|entry| entry.peer_id.as_deref() == peer_id)
            .map(|entry| entry.command.clone())
            .collect()
    }
}

/// Backlog persisted to a JSON file.
pub struct FileBacklog {
    path: PathBuf,
    data: Mutex<BacklogData>,
}

impl FileBacklog {
    /// Open (or create) a backlog at `path`, loading any surviving
    /// entries. An unreadable file is treated as empty rather than
    /// blocking startup.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match Self::read_file(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read backlog, starting empty");
                BacklogData::default()
            }
        };
        debug!(
            path = %path.display(),
            entries = data.entries.len(),
            "backlog opened"
        );
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    fn read_file(path: &Path) -> Result<BacklogData> {
        if !path.exists() {
            return Ok(BacklogData::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Write the full store atomically: serialise to a temp file next to
    /// the target, sync, rename over it.
    fn write_file(&self, data: &BacklogData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = self.path.with_extension(format!("tmp.{}", std::process::id()));
        let serialized = serde_json::to_string_pretty(data)?;
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(serialized.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        if let Ok(dir) = File::open(self.path.parent().unwrap_or_else(|| Path::new("."))) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

impl CommandBacklog for FileBacklog {
    fn enqueue(&self, peer_id: Option<&str>, command: &RpcCommand) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.apply_enqueue(peer_id, command);
        self.write_file(&data)
    }

    fn peek_all(&self, peer_id: Option<&str>) -> Vec<RpcCommand> {
        self.data.lock().unwrap().for_peer(peer_id)
    }

    fn remove(&self, peer_id: Option<&str>, command_id: i64) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if data.apply_remove(peer_id, command_id) {
            self.write_file(&data)?;
        }
        Ok(())
    }
}

/// In-memory backlog for tests and hosts that opt out of durability.
#[derive(Default)]
pub struct MemoryBacklog {
    data: Mutex<BacklogData>,
}

impl MemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandBacklog for MemoryBacklog {
    fn enqueue(&self, peer_id: Option<&str>, command: &RpcCommand) -> Result<()> {
        self.data.lock().unwrap().apply_enqueue(peer_id, command);
        Ok(())
    }

    fn peek_all(&self, peer_id: Option<&str>) -> Vec<RpcCommand> {
        self.data.lock().unwrap().for_peer(peer_id)
    }

    fn remove(&self, peer_id: Option<&str>, command_id: i64) -> Result<()> {
        self.data.lock().unwrap().apply_remove(peer_id, command_id);
        Ok(())
    }
}

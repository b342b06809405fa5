//! The node's command log.
//!
//! Consensus only needs two things from the log: the position of its tail
//! (for the vote currency check) and a way to hand it admitted commands.
//! [`MemoryLog`] keeps everything in a `RwLock<Vec<_>>`; nothing is
//! persisted.

use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Index and term of a log entry. `(0, 0)` denotes the empty log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPosition {
    // Field order matters: ordering compares term first, then index.
    pub term: u64,
    pub index: u64,
}

impl LogPosition {
    /// True if a log ending at `self` is at least as up to date as one
    /// ending at `other`.
    pub fn is_at_least(&self, other: &LogPosition) -> bool {
        self >= other
    }
}

/// One stored command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LogEntry {
    /// 1-based position in the log.
    pub index: u64,
    /// Term of the leader that admitted the entry.
    pub term: u64,
    /// Command name.
    pub name: String,
    /// Opaque command payload.
    pub body: String,
}

/// Async log contract used by the admission path.
pub trait ReplicatedLog: Send + Sync + 'static {
    /// Position of the last entry.
    fn last_position(&self) -> LogPosition;

    /// Append a command admitted in `term`, returning its index once stored.
    fn append(
        &self,
        term: u64,
        name: String,
        body: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    /// Copy of every entry, oldest first.
    fn entries(&self) -> Vec<LogEntry>;
}

/// Volatile in-memory log.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: RwLock<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicatedLog for MemoryLog {
    fn last_position(&self) -> LogPosition {
        let entries = self.entries.read().expect("rwlock poisoned");
        entries
            .last()
            .map(|e| LogPosition {
                term: e.term,
                index: e.index,
            })
            .unwrap_or_default()
    }

    fn append(
        &self,
        term: u64,
        name: String,
        body: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = self.entries.write().expect("rwlock poisoned");
            if let Some(last) = entries.last() {
                if term < last.term {
                    return Err(anyhow::anyhow!(
                        "refusing entry from term {term}, log tail is at term {}",
                        last.term
                    ));
                }
            }
            let index = entries.len() as u64 + 1;
            entries.push(LogEntry {
                index,
                term,
                name,
                body,
            });
            Ok(index)
        })
    }

    fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().expect("rwlock poisoned").clone()
    }
}

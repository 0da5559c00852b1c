//! Outstanding-request bookkeeping.
//!
//! Every command that expects a terminal response is registered here with its
//! completion handle and a timeout timer. Whoever removes the entry settles it:
//! the dispatcher (SUCCESS / ERROR), the timer (timeout), or teardown
//! (`fail_all`). Removal happens under the table lock, so an entry can only be
//! taken once and is therefore resolved exactly once.
//!
//! An entry may also carry the caller's progress listener. It receives
//! progress only while the entry is in the table, so it is out of the
//! picture before the caller can observe the outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;

use super::error::{ChannelError, ChannelResult};
use super::events::Listener;
use super::protocol::CommandKind;

/// Identifier tagging a command and its terminal response.
pub type CorrelationId = u64;

/// Receiving half handed to the caller that issued the command.
pub type Completion = oneshot::Receiver<ChannelResult<Value>>;

/// A command waiting for its terminal response.
pub struct PendingRequest {
    id: CorrelationId,
    kind: CommandKind,
    issued_at: Instant,
    completion: oneshot::Sender<ChannelResult<Value>>,
    timer: Option<AbortHandle>,
    progress: Option<Listener>,
}

impl PendingRequest {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Time since the command was registered.
    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Cancel the timer and deliver the outcome. Consumes the entry.
    pub fn resolve(mut self, outcome: ChannelResult<Value>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // The caller may have stopped waiting; nothing to deliver to then.
        let _ = self.completion.send(outcome);
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("issued_at", &self.issued_at)
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

/// Map of outstanding correlation ids to their pending requests.
#[derive(Debug, Clone, Default)]
pub struct CorrelationTable {
    entries: Arc<Mutex<HashMap<CorrelationId, PendingRequest>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command and arm its timeout. `progress` is the caller's
    /// listener for the life of this entry.
    ///
    /// The timer is spawned while the table lock is held, so even a zero
    /// timeout cannot fire before the entry exists.
    pub async fn register(
        &self,
        id: CorrelationId,
        kind: CommandKind,
        timeout: Duration,
        progress: Option<Listener>,
    ) -> Completion {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().await;

        let table = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(id, timeout).await;
        });

        let previous = entries.insert(
            id,
            PendingRequest {
                id,
                kind,
                issued_at: Instant::now(),
                completion: tx,
                timer: Some(timer.abort_handle()),
                progress,
            },
        );
        debug_assert!(previous.is_none(), "correlation id {id} reused");
        rx
    }

    /// Remove an entry without settling it. Returns `None` for unknown or
    /// already-settled ids.
    pub async fn take(&self, id: CorrelationId) -> Option<PendingRequest> {
        self.entries.lock().await.remove(&id)
    }

    /// Settle an entry with the given outcome. Returns `false` if the id is
    /// unknown (late or duplicate delivery).
    pub async fn settle(&self, id: CorrelationId, outcome: ChannelResult<Value>) -> bool {
        match self.take(id).await {
            Some(pending) => {
                pending.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding entry with `error`. Returns how many were failed.
    pub async fn fail_all(&self, error: ChannelError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, pending)| pending).collect()
        };

        let count = drained.len();
        for pending in drained {
            pending.resolve(Err(error.clone()));
        }
        count
    }

    /// Progress listeners of every outstanding entry.
    pub async fn progress_listeners(&self) -> Vec<Listener> {
        self.entries
            .lock()
            .await
            .values()
            .filter_map(|pending| pending.progress.clone())
            .collect()
    }

    /// Number of outstanding entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn expire(&self, id: CorrelationId, after: Duration) {
        let Some(mut pending) = self.take(id).await else {
            return;
        };
        // This task is the timer; nothing left to abort.
        pending.timer = None;
        tracing::warn!(id, command = %pending.kind, ?after, "command timed out");
        let kind = pending.kind;
        pending.resolve(Err(ChannelError::Timeout { kind, after }));
    }
}

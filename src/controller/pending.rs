//! Correlation of commands with their acknowledgements.
//!
//! [`PendingRequests::register`] hands out a [`PendingHandle`];
//! [`PendingRequests::resolve`] completes it exactly once and
//! [`PendingRequests::wait`] awaits it with a deadline. An entry never
//! outlives its resolution or its timeout.

use crate::error::{FleetError, Result};
use crate::protocol::Message;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

struct PendingEntry {
    operation: String,
    created: Instant,
    resolve: oneshot::Sender<Result<Message>>,
    progress: watch::Sender<Option<Message>>,
    dedup_key: Option<String>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<String, PendingEntry>,
    /// Dedup key to the request currently holding it (index updates are
    /// keyed by serial)
    locked_keys: HashMap<String, String>,
}

impl PendingTable {
    fn take(&mut self, request_id: &str) -> Option<PendingEntry> {
        let entry = self.entries.remove(request_id)?;
        if let Some(ref key) = entry.dedup_key {
            if self.locked_keys.get(key).map(String::as_str) == Some(request_id) {
                self.locked_keys.remove(key);
            }
        }
        Some(entry)
    }
}

/// Caller's side of one in-flight request.
pub struct PendingHandle {
    request_id: String,
    operation: String,
    outcome: oneshot::Receiver<Result<Message>>,
    progress: watch::Receiver<Option<Message>>,
}

impl PendingHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Latest intermediate acknowledgement, if any. The sender closes once
    /// the request is resolved or timed out.
    pub fn progress(&self) -> watch::Receiver<Option<Message>> {
        self.progress.clone()
    }
}

#[derive(Default)]
pub struct PendingRequests {
    table: Mutex<PendingTable>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id. With a `dedup_key`, returns `None` while
    /// another request holding the same key is outstanding.
    pub async fn register(&self, operation: impl Into<String>, dedup_key: Option<&str>) -> Option<PendingHandle> {
        let mut table = self.table.lock().await;
        if let Some(key) = dedup_key {
            if table.locked_keys.contains_key(key) {
                debug!(key, "Request already outstanding");
                return None;
            }
        }

        let request_id = Uuid::new_v4().to_string();
        if let Some(key) = dedup_key {
            table.locked_keys.insert(key.to_string(), request_id.clone());
        }
        let operation = operation.into();
        let (resolve, outcome) = oneshot::channel();
        let (progress_tx, progress) = watch::channel(None);
        table.entries.insert(
            request_id.clone(),
            PendingEntry {
                operation: operation.clone(),
                created: Instant::now(),
                resolve,
                progress: progress_tx,
                dedup_key: dedup_key.map(str::to_string),
            },
        );
        trace!(%request_id, %operation, "Request registered");

        Some(PendingHandle {
            request_id,
            operation,
            outcome,
            progress,
        })
    }

    /// Record an intermediate acknowledgement without resolving.
    pub async fn update(&self, request_id: &str, snapshot: Message) -> bool {
        let table = self.table.lock().await;
        match table.entries.get(request_id) {
            Some(entry) => {
                entry.progress.send_replace(Some(snapshot));
                true
            }
            None => false,
        }
    }

    /// Complete a request. Unknown or already resolved ids return `false`.
    pub async fn resolve(&self, request_id: &str, outcome: Result<Message>) -> bool {
        let Some(entry) = self.table.lock().await.take(request_id) else {
            trace!(%request_id, "Ignoring acknowledgement for unknown request");
            return false;
        };
        debug!(
            %request_id,
            operation = %entry.operation,
            elapsed = ?entry.created.elapsed(),
            "Request resolved"
        );
        let _ = entry.resolve.send(outcome);
        true
    }

    pub async fn abort(&self, request_id: &str, error: FleetError) -> bool {
        self.resolve(request_id, Err(error)).await
    }

    /// Await resolution until `timeout`. On expiry the entry and its dedup
    /// key are removed before the timeout error is returned.
    pub async fn wait(&self, handle: PendingHandle, timeout: Duration) -> Result<Message> {
        let PendingHandle {
            request_id,
            operation,
            mut outcome,
            ..
        } = handle;
        let deadline = Instant::now() + timeout;

        match timeout_at(deadline, &mut outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FleetError::Shutdown),
            Err(_) => {
                self.table.lock().await.take(&request_id);
                // An ack may have landed between the deadline and the removal.
                if let Ok(result) = outcome.try_recv() {
                    return result;
                }
                debug!(%request_id, %operation, "Request timed out");
                Err(FleetError::timeout(operation, timeout))
            }
        }
    }

    /// Resolve every waiter with `Shutdown`.
    pub async fn fail_all(&self) {
        let mut table = self.table.lock().await;
        let count = table.entries.len();
        for (_, entry) in table.entries.drain() {
            let _ = entry.resolve.send(Err(FleetError::Shutdown));
        }
        table.locked_keys.clear();
        if count > 0 {
            debug!(count, "Failed pending requests on shutdown");
        }
    }

    pub async fn contains(&self, request_id: &str) -> bool {
        self.table.lock().await.entries.contains_key(request_id)
    }

    #[cfg(test)]
    pub async fn is_locked(&self, key: &str) -> bool {
        self.table.lock().await.locked_keys.contains_key(key)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.table.lock().await.entries.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

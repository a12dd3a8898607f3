//! Correlation of host-directed unary callbacks with their responses.
//!
//! When a handler calls back into the embedding host it fires an
//! asynchronous callback tagged with a fresh request id and blocks until
//! the host answers with the same id. This matcher owns that pairing: a
//! pending map of single-value channels, a timeout that reclaims abandoned
//! entries, and a hot-reload cleanup that releases every stuck waiter when
//! the host re-registers its callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::Status;

/// Default time a caller waits for the host's response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// The response side of one pending request. `None` means the entry was
/// released by [`PendingRequests::cleanup`] rather than answered.
pub type ResponseReceiver = oneshot::Receiver<Option<Bytes>>;

/// Pending host-directed requests keyed by request id.
pub struct PendingRequests {
    pending: Mutex<HashMap<i64, oneshot::Sender<Option<Bytes>>>>,
    next_id: AtomicI64,
    timeout: Mutex<Duration>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new(response_timeout_from_env())
    }
}

fn response_timeout_from_env() -> Duration {
    std::env::var("GANGWAY_HOST_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_RESPONSE_TIMEOUT)
}

impl PendingRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(0),
            timeout: Mutex::new(timeout),
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn contains(&self, request_id: i64) -> bool {
        self.pending.lock().contains_key(&request_id)
    }

    /// Register a new pending request. The caller invokes the host with the
    /// returned id and then awaits the receiver via [`wait`](Self::wait).
    pub fn create(&self) -> (i64, ResponseReceiver) {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        (request_id, rx)
    }

    /// Wait for the host's response.
    ///
    /// On timeout the pending entry is removed so a late response cannot
    /// leak it, and the error message begins with "timeout" so callers can
    /// surface the cause verbatim.
    pub async fn wait(&self, request_id: i64, rx: ResponseReceiver) -> Result<Option<Bytes>, Status> {
        let timeout = *self.timeout.lock();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                Err(Status::internal("host response channel dropped"))
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                tracing::warn!(request_id, "timed out waiting for host response");
                Err(Status::deadline_exceeded(
                    "timeout waiting for host response",
                ))
            }
        }
    }

    /// Deliver the host's response to the waiter holding `request_id`.
    /// A response with no matching waiter is logged and dropped.
    pub fn complete(&self, request_id: i64, payload: Bytes) {
        let waiter = self.pending.lock().remove(&request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Some(payload));
            }
            None => {
                tracing::warn!(request_id, "response for unknown request id dropped");
            }
        }
    }

    /// Release every pending entry with a `None` response and clear the
    /// map. Run when the host re-registers its callback (hot reload) so
    /// waiters keyed against the old callback fail fast instead of hanging.
    pub fn cleanup(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        let released = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(None);
        }
        if released > 0 {
            tracing::debug!(released, "released pending host requests");
        }
    }
}

//! Process-wide session registry.
//!
//! The C ABI cannot safely convey typed pointers, so every cross-boundary
//! identity is an opaque monotonically increasing id resolved through this
//! table under a lock. A concurrent teardown can therefore never be raced
//! into a dangling session: a lookup either finds a live session or nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::{HostSink, Status, StreamKind, StreamSession};

/// Inbound channel capacity for sessions fed by the FFI host-push path.
pub const FFI_INBOUND_CAPACITY: usize = 100;

/// Inbound channel capacity for in-process and plugin-side sessions.
pub const LOCAL_INBOUND_CAPACITY: usize = 16;

/// Runtime configuration for streaming sessions.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// How long a handler's `wait_ready` blocks before giving up.
    /// Zero means wait indefinitely.
    pub ready_timeout: Duration,
    /// Inbound channel capacity for sessions created by `create`.
    pub inbound_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ready_timeout: ready_timeout_from_env(),
            inbound_capacity: FFI_INBOUND_CAPACITY,
        }
    }
}

fn ready_timeout_from_env() -> Duration {
    std::env::var("GANGWAY_READY_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}

/// Registry of live streaming sessions, keyed by session id.
pub struct StreamRegistry {
    sessions: RwLock<HashMap<i64, Arc<StreamSession>>>,
    next_id: AtomicI64,
    /// Sink snapshot handed to newly created sessions. Settable at any
    /// time; existing sessions keep the sink they were created with.
    sink: Mutex<Option<Arc<dyn HostSink>>>,
    config: Mutex<StreamConfig>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_config(StreamConfig::default())
    }

    pub fn with_config(config: StreamConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(0),
            sink: Mutex::new(None),
            config: Mutex::new(config),
        }
    }

    /// Replace the sink used by sessions created from now on.
    pub fn set_host_sink(&self, sink: Option<Arc<dyn HostSink>>) {
        *self.sink.lock() = sink;
    }

    pub fn host_sink(&self) -> Option<Arc<dyn HostSink>> {
        self.sink.lock().clone()
    }

    pub fn set_config(&self, config: StreamConfig) {
        *self.config.lock() = config;
    }

    pub fn config(&self) -> StreamConfig {
        self.config.lock().clone()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Create and register a session wired to the current host sink.
    pub fn create(&self, method: &str, kind: StreamKind) -> Arc<StreamSession> {
        let config = self.config();
        let sink = self.host_sink();
        self.create_with_sink(method, kind, sink, config.inbound_capacity)
    }

    /// Create and register a session with an explicit sink and inbound
    /// capacity (in-process consumers, tests).
    pub fn create_with_sink(
        &self,
        method: &str,
        kind: StreamKind,
        sink: Option<Arc<dyn HostSink>>,
        inbound_capacity: usize,
    ) -> Arc<StreamSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ready_timeout = self.config().ready_timeout;
        let session = StreamSession::new(id, method, kind, inbound_capacity, sink, ready_timeout);
        self.sessions.write().insert(id, session.clone());
        tracing::debug!(session_id = id, method, kind = %kind, "created stream session");
        session
    }

    pub fn lookup(&self, session_id: i64) -> Option<Arc<StreamSession>> {
        self.sessions.read().get(&session_id).cloned()
    }

    /// Remove and tear down a session. Idempotent: closing an unknown or
    /// already-closed id is a no-op.
    pub async fn close(&self, session_id: i64) {
        let session = self.sessions.write().remove(&session_id);
        if let Some(session) = session {
            session.teardown().await;
            tracing::debug!(session_id, "closed stream session");
        }
    }

    /// EOF from the sending peer.
    pub fn close_input(&self, session_id: i64) {
        if let Some(session) = self.lookup(session_id) {
            session.close_input();
        }
    }

    /// Push one payload into a session's inbound channel.
    pub async fn push(&self, session_id: i64, payload: Bytes) -> Result<(), Status> {
        let session = self
            .lookup(session_id)
            .ok_or_else(|| Status::session_not_found(session_id))?;
        session.push(payload).await
    }

    /// Signal that the caller's subscriber is installed.
    pub fn signal_ready(&self, session_id: i64) {
        match self.lookup(session_id) {
            Some(session) => session.signal_ready(),
            None => tracing::warn!(session_id, "ready signal for unknown stream session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn ids_are_unique_under_concurrent_creation() {
        let registry = Arc::new(StreamRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..25 {
                    ids.push(registry.create("test/ids", StreamKind::BidiStream).id());
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "session id {id} was reused");
            }
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(registry.len(), 400);

        // Ids are not reused after close.
        let max_id = *seen.iter().max().unwrap();
        for id in seen {
            registry.close(id).await;
        }
        assert!(registry.is_empty());
        let next = registry.create("test/ids", StreamKind::BidiStream);
        assert!(next.id() > max_id);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = StreamRegistry::new();
        let session = registry.create("test/close", StreamKind::ServerStream);
        let id = session.id();
        registry.close(id).await;
        registry.close(id).await;
        assert!(session.is_closed());
        assert!(registry.lookup(id).is_none());
    }

    #[tokio::test]
    async fn push_to_unknown_session_is_not_found() {
        let registry = StreamRegistry::new();
        let err = registry
            .push(42, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn push_after_close_reports_session_closed() {
        let registry = StreamRegistry::new();
        let session = registry.create("test/gone", StreamKind::ClientStream);
        let id = session.id();
        registry.close(id).await;
        let err = registry.push(id, Bytes::from_static(b"x")).await.unwrap_err();
        // The registry entry is gone, so this surfaces as not-found.
        assert_eq!(err.code, crate::ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn ready_for_unknown_session_does_not_panic() {
        let registry = StreamRegistry::new();
        registry.signal_ready(999);
    }

    #[tokio::test]
    async fn new_sessions_pick_up_replaced_sink() {
        use crate::{FrameKind, QueueSink};

        let registry = StreamRegistry::new();
        let before = registry.create("test/sink", StreamKind::ServerStream);

        let (sink, mut rx) = QueueSink::bounded(4);
        registry.set_host_sink(Some(sink));
        let after = registry.create("test/sink", StreamKind::ServerStream);

        // The pre-registration session has no sink: frames are dropped.
        before.send(Bytes::from_static(b"lost")).await.unwrap();
        after.send(Bytes::from_static(b"seen")).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.session_id, after.id());
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.payload.as_ref(), b"seen");
    }
}

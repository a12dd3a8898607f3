//! StreamSession: one in-flight streaming RPC.
//!
//! A session owns two directions. Inbound is a bounded channel the peer
//! pushes into (`push`) and the handler drains (`recv`). Outbound is a
//! [`HostSink`] the handler writes frames to (`send`, `close_send`, `end`,
//! `error`). Two one-shot events coordinate lifecycle: `ready` fires when
//! the caller has installed its subscriber, `done` fires on teardown and
//! releases every suspended operation.
//!
//! # Key invariant
//!
//! Exactly one task owns the handler side of a session. The write-side
//! operations still serialize through a per-session mutex so header flushing
//! and frame order stay well-defined even if that rule is bent.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{Event, FfiMessage, FrameKind, Metadata, OutboundFrame, Status};

/// The shape of a streaming RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// The service sends multiple responses.
    ServerStream,
    /// The caller sends multiple requests.
    ClientStream,
    /// Both sides stream.
    BidiStream,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerStream => write!(f, "server-stream"),
            Self::ClientStream => write!(f, "client-stream"),
            Self::BidiStream => write!(f, "bidi-stream"),
        }
    }
}

/// Outbound frame delivery.
///
/// The FFI layer implements this over the registered host callbacks; tests
/// and local consumers use [`QueueSink`]. `send_frame` may apply
/// backpressure; a synchronous sink returns a ready future.
pub trait HostSink: Send + Sync {
    /// Deliver one frame. Payload ownership passes to the sink.
    fn send_frame(
        &self,
        session_id: i64,
        kind: FrameKind,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<(), Status>>;

    /// Zero-copy DATA delivery: serialize `message` straight into the
    /// sink's destination buffer. Returns `None` when the sink has no
    /// zero-copy path; the session then falls back to encode-and-copy.
    fn send_data_message(
        &self,
        _session_id: i64,
        _message: &dyn FfiMessage,
    ) -> Option<Result<(), Status>> {
        None
    }
}

/// A [`HostSink`] backed by a bounded channel of [`OutboundFrame`]s.
///
/// The receiving half must be drained; a full channel applies backpressure
/// to the handler.
pub struct QueueSink {
    tx: mpsc::Sender<OutboundFrame>,
}

impl QueueSink {
    /// Create a sink and the receiver observing its frames.
    pub fn bounded(capacity: usize) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self { tx }), rx)
    }
}

impl HostSink for QueueSink {
    fn send_frame(
        &self,
        session_id: i64,
        kind: FrameKind,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<(), Status>> {
        Box::pin(async move {
            self.tx
                .send(OutboundFrame {
                    session_id,
                    kind,
                    payload,
                })
                .await
                .map_err(|_| Status::cancelled("outbound subscriber dropped"))
        })
    }
}

struct SessionState {
    closed: bool,
    input_closed: bool,
    headers_sent: bool,
    headers: Metadata,
    trailers: Metadata,
    error: Option<Status>,
    /// Present until the input side is closed; cloned by `push`.
    inbound_tx: Option<mpsc::Sender<Bytes>>,
}

/// One in-flight streaming RPC session.
pub struct StreamSession {
    id: i64,
    method: String,
    kind: StreamKind,
    ready_timeout: Duration,
    sink: Option<Arc<dyn HostSink>>,
    state: Mutex<SessionState>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    /// Serializes send/close_send/end/error/send_header and teardown.
    write_gate: tokio::sync::Mutex<()>,
    done: Event,
    ready: Event,
}

impl StreamSession {
    pub(crate) fn new(
        id: i64,
        method: &str,
        kind: StreamKind,
        inbound_capacity: usize,
        sink: Option<Arc<dyn HostSink>>,
        ready_timeout: Duration,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);
        Arc::new(Self {
            id,
            method: method.to_string(),
            kind,
            ready_timeout,
            sink,
            state: Mutex::new(SessionState {
                closed: false,
                input_closed: false,
                headers_sent: false,
                headers: Metadata::new(),
                trailers: Metadata::new(),
                error: None,
                inbound_tx: Some(inbound_tx),
            }),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            write_gate: tokio::sync::Mutex::new(()),
            done: Event::new(),
            ready: Event::new(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_input_closed(&self) -> bool {
        self.state.lock().input_closed
    }

    /// The terminal error, once [`error`](Self::error) has run.
    pub fn error_status(&self) -> Option<Status> {
        self.state.lock().error.clone()
    }

    /// The `done` event; fires on teardown.
    pub fn done(&self) -> &Event {
        &self.done
    }

    // ------------------------------------------------------------------
    // Peer-facing operations (driven through the registry)
    // ------------------------------------------------------------------

    /// Push one inbound payload. Blocks while the inbound channel is full,
    /// bounded by session teardown.
    pub async fn push(&self, payload: Bytes) -> Result<(), Status> {
        let tx = {
            let state = self.state.lock();
            if state.closed {
                return Err(Status::session_closed(self.id));
            }
            if state.input_closed {
                return Err(Status::input_closed(self.id));
            }
            state
                .inbound_tx
                .clone()
                .ok_or_else(|| Status::input_closed(self.id))?
        };

        tokio::select! {
            res = tx.send(payload) => res.map_err(|_| Status::session_closed(self.id)),
            _ = self.done.wait() => Err(Status::session_closed(self.id)),
        }
    }

    /// Signal EOF from the sending peer. Closes the inbound channel exactly
    /// once; the handler's `recv` drains buffered payloads and then yields
    /// `None`.
    pub fn close_input(&self) {
        let mut state = self.state.lock();
        if state.closed || state.input_closed {
            return;
        }
        state.input_closed = true;
        state.inbound_tx = None;
        tracing::debug!(session_id = self.id, "stream input closed");
    }

    /// Signal that the caller's subscriber is installed. Idempotent.
    pub fn signal_ready(&self) {
        if self.ready.fire() {
            tracing::debug!(session_id = self.id, "stream ready signal received");
        }
    }

    // ------------------------------------------------------------------
    // Handler-facing operations
    // ------------------------------------------------------------------

    /// Wait for the caller's ready signal.
    ///
    /// Returns `true` when ready fired, `false` when the session was torn
    /// down first or the configured readiness timeout elapsed. A zero
    /// timeout waits indefinitely.
    pub async fn wait_ready(&self) -> bool {
        if self.ready_timeout.is_zero() {
            tokio::select! {
                _ = self.ready.wait() => true,
                _ = self.done.wait() => false,
            }
        } else {
            tokio::select! {
                _ = self.ready.wait() => true,
                _ = self.done.wait() => false,
                _ = tokio::time::sleep(self.ready_timeout) => {
                    tracing::warn!(
                        session_id = self.id,
                        timeout_ms = self.ready_timeout.as_millis() as u64,
                        "timed out waiting for stream ready signal"
                    );
                    false
                }
            }
        }
    }

    /// Receive the next inbound payload. `None` after input close or
    /// teardown.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Append a header pair. Headers are emitted once, before the first
    /// DATA frame.
    pub fn set_header(&self, key: &str, value: &str) -> Result<(), Status> {
        self.state.lock().headers.set(key, value)
    }

    /// Append a trailer pair. Trailers are emitted once, immediately before
    /// END.
    pub fn set_trailer(&self, key: &str, value: &str) -> Result<(), Status> {
        self.state.lock().trailers.set(key, value)
    }

    /// Emit pending headers as a HEADER frame. Idempotent: only the first
    /// call (or the first DATA frame) takes effect.
    pub async fn send_header(&self) -> Result<(), Status> {
        let _gate = self.write_gate.lock().await;
        self.flush_headers().await
    }

    /// Emit a DATA frame carrying `payload`.
    pub async fn send(&self, payload: Bytes) -> Result<(), Status> {
        let _gate = self.write_gate.lock().await;
        if self.state.lock().closed {
            return Err(Status::session_closed(self.id));
        }
        self.flush_headers().await?;
        self.emit(FrameKind::Data, payload).await
    }

    /// Emit a DATA frame, serializing `message` directly into the sink's
    /// destination when it has a zero-copy path.
    pub async fn send_message(&self, message: &dyn FfiMessage) -> Result<(), Status> {
        let _gate = self.write_gate.lock().await;
        if self.state.lock().closed {
            return Err(Status::session_closed(self.id));
        }
        self.flush_headers().await?;

        if let Some(sink) = &self.sink {
            if let Some(result) = sink.send_data_message(self.id, message) {
                return result;
            }
        }
        let mut buf = vec![0u8; message.encoded_len()];
        message.encode_into(&mut buf)?;
        self.emit(FrameKind::Data, Bytes::from(buf)).await
    }

    /// Emit an END frame without tearing the session down.
    ///
    /// Used when the handler has finished producing output but still wants
    /// to drain input (client-streaming EOF handshake, independent bidi
    /// half-close).
    pub async fn close_send(&self) -> Result<(), Status> {
        let _gate = self.write_gate.lock().await;
        if self.state.lock().closed {
            return Err(Status::session_closed(self.id));
        }
        self.emit(FrameKind::End, Bytes::new()).await
    }

    /// Terminate successfully: flush trailers, emit END, tear down.
    pub async fn end(&self) -> Result<(), Status> {
        let _gate = self.write_gate.lock().await;
        let trailers = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.input_closed = true;
            state.inbound_tx = None;
            std::mem::take(&mut state.trailers)
        };

        // done must fire even if the sink rejects the final frames, or
        // teardown waiters would hang on a half-ended session.
        let mut result = Ok(());
        if !trailers.is_empty() {
            result = self.emit(FrameKind::Trailer, trailers.encode()).await;
        }
        if result.is_ok() {
            result = self.emit(FrameKind::End, Bytes::new()).await;
        }
        self.done.fire();
        tracing::debug!(session_id = self.id, method = %self.method, "stream ended");
        result
    }

    /// Terminate with an error: emit ERROR, tear down. No frames follow.
    pub async fn error(&self, status: Status) {
        let _gate = self.write_gate.lock().await;
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.input_closed = true;
            state.inbound_tx = None;
            state.error = Some(status.clone());
        }

        let payload = Bytes::from(status.message.clone().into_bytes());
        if let Err(e) = self.emit(FrameKind::Error, payload).await {
            tracing::debug!(session_id = self.id, error = %e, "error frame not delivered");
        }
        self.done.fire();
        tracing::debug!(
            session_id = self.id,
            method = %self.method,
            status = %status,
            "stream failed"
        );
    }

    /// Tear down without emitting frames (caller-initiated close).
    pub(crate) async fn teardown(&self) {
        // Fire done before taking the gate so a writer blocked on a full
        // sink fails promptly instead of holding the gate forever.
        self.done.fire();
        let _gate = self.write_gate.lock().await;
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.input_closed = true;
        state.inbound_tx = None;
    }

    /// Flush pending headers as a HEADER frame. Caller holds the write gate.
    async fn flush_headers(&self) -> Result<(), Status> {
        let headers = {
            let mut state = self.state.lock();
            if state.headers_sent {
                return Ok(());
            }
            state.headers_sent = true;
            std::mem::take(&mut state.headers)
        };
        if headers.is_empty() {
            return Ok(());
        }
        self.emit(FrameKind::Header, headers.encode()).await
    }

    async fn emit(&self, kind: FrameKind, payload: Bytes) -> Result<(), Status> {
        let Some(sink) = &self.sink else {
            tracing::trace!(
                session_id = self.id,
                kind = ?kind,
                "no outbound sink registered; dropping frame"
            );
            return Ok(());
        };
        tokio::select! {
            biased;
            res = sink.send_frame(self.id, kind, payload) => res,
            _ = self.done.wait() => Err(Status::session_closed(self.id)),
        }
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

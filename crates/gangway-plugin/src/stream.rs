//! Stream handle over the plugin C ABI.
//!
//! State machine: OPEN → SEND-CLOSED (after `close_send`; recv still
//! allowed) → CLOSED (terminal recv error, recv EOF, or explicit `close`).
//! Send and recv are guarded by their own mutexes so a full-duplex bidi
//! stream can run both halves concurrently.
//!
//! The underlying C calls block, so they run on the blocking thread pool.
//! Dropping a caller's future abandons the join handle: the call finishes
//! inside the shared library and its result is discarded. FFI calls are
//! never truly cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::{Plugin, PluginError};

/// An open streaming RPC on a loaded plugin.
pub struct PluginStream {
    plugin: Arc<Plugin>,
    handle: u64,
    closed: AtomicBool,
    send_gate: Mutex<()>,
    recv_gate: Mutex<()>,
}

impl std::fmt::Debug for PluginStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginStream")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PluginStream {
    pub(crate) fn new(plugin: Arc<Plugin>, handle: u64) -> Self {
        Self {
            plugin,
            handle,
            closed: AtomicBool::new(false),
            send_gate: Mutex::new(()),
            recv_gate: Mutex::new(()),
        }
    }

    /// The opaque handle the plugin knows this stream by.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one message (client-streaming and bidi).
    pub async fn send(&self, data: &[u8]) -> Result<(), PluginError> {
        let _gate = self.send_gate.lock().await;
        if self.is_closed() {
            return Err(PluginError::StreamClosed);
        }
        if data.len() > i32::MAX as usize {
            return Err(PluginError::TooLarge);
        }
        let plugin = self.plugin.clone();
        let handle = self.handle;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || plugin.stream_send_raw(handle, &data))
            .await
            .map_err(|e| PluginError::Stream(format!("send task failed: {e}")))?
    }

    /// Receive one message (server-streaming and bidi). `Ok(None)` is EOF.
    ///
    /// A terminal result (EOF or error) closes the stream; further recvs
    /// return EOF.
    pub async fn recv(&self) -> Result<Option<Vec<u8>>, PluginError> {
        let _gate = self.recv_gate.lock().await;
        if self.is_closed() {
            return Ok(None);
        }
        let plugin = self.plugin.clone();
        let handle = self.handle;
        let result = tokio::task::spawn_blocking(move || plugin.stream_recv_raw(handle))
            .await
            .map_err(|e| PluginError::Stream(format!("recv task failed: {e}")))?;

        if !matches!(result, Ok(Some(_))) {
            self.close_internal();
        }
        result
    }

    /// Close the send half; recv remains usable.
    pub async fn close_send(&self) -> Result<(), PluginError> {
        let _gate = self.send_gate.lock().await;
        if self.is_closed() {
            return Ok(());
        }
        let plugin = self.plugin.clone();
        let handle = self.handle;
        tokio::task::spawn_blocking(move || plugin.stream_close_send_raw(handle))
            .await
            .map_err(|e| PluginError::Stream(format!("close-send task failed: {e}")))?
    }

    /// Close the stream completely. Idempotent.
    pub fn close(&self) {
        self.close_internal();
    }

    fn close_internal(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.plugin.stream_close_raw(self.handle);
    }
}

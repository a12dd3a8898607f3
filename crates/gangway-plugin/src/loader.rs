//! Plugin loading, symbol caching, and safe unload.
//!
//! The unload hazard: a `close()` racing an in-flight FFI call would unmap
//! code that is still executing. Every outward call therefore holds a
//! ticket on an in-flight gauge, acquired while the closed flag is checked
//! under the state lock. `close()` flips the flag, cancels every tracked
//! stream handle, waits for the gauge to drain to zero, and only then
//! unloads the library.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::platform::{DlPlatform, LibraryHandle, PluginPlatform, RawSymbol};
use crate::{PluginError, PluginStream};

/// Required allocation releaser.
const SYM_FREE: &str = "Gangway_Free";
const SYM_INVOKE_PREFIX: &str = "Gangway_Invoke_";
const SYM_STREAM_OPEN_PREFIX: &str = "Gangway_Stream_";
const SYM_STREAM_OPEN_SUFFIX: &str = "_Open";
const SYM_STREAM_SEND: &str = "Gangway_Stream_Send";
const SYM_STREAM_RECV: &str = "Gangway_Stream_Recv";
const SYM_STREAM_CLOSE_SEND: &str = "Gangway_Stream_CloseSend";
const SYM_STREAM_CLOSE: &str = "Gangway_Stream_Close";

/// Maximum payload the 32-bit signed C length can describe.
const MAX_C_PAYLOAD: usize = i32::MAX as usize;

/// Global stream function block, resolved once per plugin.
#[derive(Clone, Copy)]
struct StreamFns {
    send: RawSymbol,
    recv: RawSymbol,
    close_send: RawSymbol,
    close: RawSymbol,
}

struct PluginState {
    library: Option<LibraryHandle>,
    free_fn: RawSymbol,
    invokers: HashMap<String, RawSymbol>,
    stream_openers: HashMap<String, RawSymbol>,
    stream_fns: Option<StreamFns>,
    /// Open stream handles, cancelled when the plugin closes.
    active_streams: HashSet<u64>,
    closed: bool,
}

/// Counts calls executing inside the shared library.
struct Inflight {
    count: AtomicUsize,
    drained: Notify,
}

impl Inflight {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Ticket held for the duration of one call into the library.
struct CallTicket<'a> {
    inflight: &'a Inflight,
}

impl Drop for CallTicket<'_> {
    fn drop(&mut self) {
        self.inflight.exit();
    }
}

/// A loaded shared-library plugin.
pub struct Plugin {
    platform: Arc<dyn PluginPlatform>,
    state: RwLock<PluginState>,
    inflight: Inflight,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin").finish_non_exhaustive()
    }
}

impl Plugin {
    /// Load a plugin shared object from `path`.
    ///
    /// The plugin must export `Gangway_Free`; a plugin without the global
    /// stream block supports unary only.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>, PluginError> {
        Self::load_with_platform(path, DlPlatform::shared())
    }

    /// Load through an explicit platform. Tests use this with a mock.
    pub fn load_with_platform(
        path: impl AsRef<Path>,
        platform: Arc<dyn PluginPlatform>,
    ) -> Result<Arc<Self>, PluginError> {
        let path = path.as_ref();
        let library = platform.open(path)?;

        let free_fn = match platform.symbol(library, SYM_FREE) {
            Ok(symbol) => symbol,
            Err(_) => {
                platform.close(library);
                return Err(PluginError::Load(format!(
                    "plugin {} missing {SYM_FREE} symbol",
                    path.display()
                )));
            }
        };

        tracing::debug!(path = %path.display(), "loaded plugin");
        Ok(Arc::new(Self {
            platform,
            state: RwLock::new(PluginState {
                library: Some(library),
                free_fn,
                invokers: HashMap::new(),
                stream_openers: HashMap::new(),
                stream_fns: None,
                active_streams: HashSet::new(),
                closed: false,
            }),
            inflight: Inflight::new(),
        }))
    }

    /// Check the closed flag and enter the in-flight gauge, atomically with
    /// respect to `close()`.
    fn begin_call(&self) -> Result<CallTicket<'_>, PluginError> {
        let state = self.state.read();
        if state.closed {
            return Err(PluginError::Closed);
        }
        self.inflight.enter();
        Ok(CallTicket {
            inflight: &self.inflight,
        })
    }

    fn invoker(&self, service: &str) -> Result<RawSymbol, PluginError> {
        if let Some(&symbol) = self.state.read().invokers.get(service) {
            return Ok(symbol);
        }

        let mut state = self.state.write();
        if state.closed {
            return Err(PluginError::Closed);
        }
        if let Some(&symbol) = state.invokers.get(service) {
            return Ok(symbol);
        }
        let library = state.library.ok_or(PluginError::Closed)?;
        let name = format!("{SYM_INVOKE_PREFIX}{service}");
        let symbol = self
            .platform
            .symbol(library, &name)
            .map_err(|_| PluginError::Symbol(name))?;
        state.invokers.insert(service.to_string(), symbol);
        Ok(symbol)
    }

    /// Resolve the global stream block. Caller holds the write lock.
    fn ensure_stream_fns(
        &self,
        state: &mut PluginState,
        library: LibraryHandle,
    ) -> Result<StreamFns, PluginError> {
        if let Some(fns) = state.stream_fns {
            return Ok(fns);
        }
        let send = self.platform.symbol(library, SYM_STREAM_SEND);
        let recv = self.platform.symbol(library, SYM_STREAM_RECV);
        let close_send = self.platform.symbol(library, SYM_STREAM_CLOSE_SEND);
        let close = self.platform.symbol(library, SYM_STREAM_CLOSE);
        match (send, recv, close_send, close) {
            (Ok(send), Ok(recv), Ok(close_send), Ok(close)) => {
                let fns = StreamFns {
                    send,
                    recv,
                    close_send,
                    close,
                };
                state.stream_fns = Some(fns);
                Ok(fns)
            }
            _ => Err(PluginError::Stream(
                "incomplete streaming support in plugin".to_string(),
            )),
        }
    }

    fn stream_opener(&self, service: &str) -> Result<RawSymbol, PluginError> {
        if let Some(&symbol) = self.state.read().stream_openers.get(service) {
            return Ok(symbol);
        }

        let mut state = self.state.write();
        if state.closed {
            return Err(PluginError::Closed);
        }
        if let Some(&symbol) = state.stream_openers.get(service) {
            return Ok(symbol);
        }
        let library = state.library.ok_or(PluginError::Closed)?;
        self.ensure_stream_fns(&mut state, library)?;

        let name = format!("{SYM_STREAM_OPEN_PREFIX}{service}{SYM_STREAM_OPEN_SUFFIX}");
        let symbol = self
            .platform
            .symbol(library, &name)
            .map_err(|_| PluginError::Symbol(name))?;
        state.stream_openers.insert(service.to_string(), symbol);
        Ok(symbol)
    }

    fn stream_fns(&self) -> Result<StreamFns, PluginError> {
        self.state
            .read()
            .stream_fns
            .ok_or_else(|| PluginError::Stream("no stream functions available".to_string()))
    }

    fn free_fn(&self) -> RawSymbol {
        self.state.read().free_fn
    }

    /// Invoke a unary method.
    ///
    /// Response wire format: byte 0 is 0 (ok) or 1 (error); the remaining
    /// bytes are the payload or the error message.
    pub fn invoke(&self, service: &str, method: &str, data: &[u8]) -> Result<Vec<u8>, PluginError> {
        let _ticket = self.begin_call()?;
        let invoker = self.invoker(service)?;
        if data.len() > MAX_C_PAYLOAD {
            return Err(PluginError::TooLarge);
        }

        let response = self
            .platform
            .invoke(invoker, self.free_fn(), method, data)?;
        match response.split_first() {
            None => Err(PluginError::Invoke(format!(
                "empty response from plugin for {method}"
            ))),
            Some((&1, message)) => Err(PluginError::Remote(
                String::from_utf8_lossy(message).into_owned(),
            )),
            Some((_, payload)) => Ok(payload.to_vec()),
        }
    }

    /// Open a streaming RPC; the returned handle is tracked for
    /// cancellation on plugin close.
    pub fn open_stream(
        self: &Arc<Self>,
        service: &str,
        method: &str,
    ) -> Result<PluginStream, PluginError> {
        let handle = {
            let _ticket = self.begin_call()?;
            let opener = self.stream_opener(service)?;
            let handle = self.platform.stream_open(opener, method);
            if handle == 0 {
                return Err(PluginError::Stream(format!(
                    "failed to open stream for {method}"
                )));
            }
            handle
        };

        // The plugin may have been closed while the open was executing: the
        // handle would never be seen by close(), so shut it down here.
        let mut state = self.state.write();
        if state.closed {
            let fns = state.stream_fns;
            drop(state);
            if let Some(fns) = fns {
                self.inflight.enter();
                self.platform.stream_close(fns.close, handle);
                self.inflight.exit();
            }
            return Err(PluginError::Closed);
        }
        state.active_streams.insert(handle);
        drop(state);

        tracing::debug!(service, method, handle, "opened plugin stream");
        Ok(PluginStream::new(self.clone(), handle))
    }

    pub(crate) fn stream_send_raw(&self, handle: u64, data: &[u8]) -> Result<(), PluginError> {
        let _ticket = self.begin_call()?;
        if data.len() > MAX_C_PAYLOAD {
            return Err(PluginError::TooLarge);
        }
        let fns = self.stream_fns()?;
        match self.platform.stream_send(fns.send, handle, data) {
            0 => Ok(()),
            code => Err(PluginError::SendFailed(code)),
        }
    }

    /// Receive from a stream. `Ok(None)` is EOF.
    pub(crate) fn stream_recv_raw(&self, handle: u64) -> Result<Option<Vec<u8>>, PluginError> {
        let _ticket = self.begin_call()?;
        let fns = self.stream_fns()?;
        let outcome = self
            .platform
            .stream_recv(fns.recv, self.free_fn(), handle);

        match outcome.status {
            0 => match outcome.data.as_deref().and_then(|d| d.split_first()) {
                None => Err(PluginError::Stream("empty stream response".to_string())),
                Some((&1, message)) => Err(PluginError::Remote(
                    String::from_utf8_lossy(message).into_owned(),
                )),
                Some((_, payload)) => Ok(Some(payload.to_vec())),
            },
            1 => Ok(None),
            status => match outcome.data {
                Some(message) if outcome.len > 0 => Err(PluginError::Stream(
                    String::from_utf8_lossy(&message).into_owned(),
                )),
                _ => Err(PluginError::Stream(format!(
                    "stream error with status {status}"
                ))),
            },
        }
    }

    pub(crate) fn stream_close_send_raw(&self, handle: u64) -> Result<(), PluginError> {
        let _ticket = self.begin_call()?;
        let fns = self.stream_fns()?;
        self.platform.stream_close_send(fns.close_send, handle);
        Ok(())
    }

    /// Explicitly close one stream handle. No-op if the plugin is closed or
    /// the handle is not tracked (already closed).
    pub(crate) fn stream_close_raw(&self, handle: u64) {
        let fns = {
            let mut state = self.state.write();
            if state.closed || state.library.is_none() {
                return;
            }
            if !state.active_streams.remove(&handle) {
                return;
            }
            let Some(fns) = state.stream_fns else {
                return;
            };
            self.inflight.enter();
            fns
        };
        self.platform.stream_close(fns.close, handle);
        self.inflight.exit();
    }

    /// Unload the plugin.
    ///
    /// Cancels every active stream, waits for every in-flight call to
    /// return, then releases the library. Errors during stream teardown are
    /// swallowed; once the drain completes the close always succeeds.
    /// Idempotent.
    pub async fn close(&self) {
        let (handles, close_fn) = {
            let mut state = self.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
            let handles: Vec<u64> = state.active_streams.drain().collect();
            (handles, state.stream_fns.map(|fns| fns.close))
        };

        // Cancel active streams outside the lock; each cancellation counts
        // as an in-flight call so it is itself covered by the drain.
        if let Some(close_fn) = close_fn {
            for handle in handles {
                self.inflight.enter();
                self.platform.stream_close(close_fn, handle);
                self.inflight.exit();
            }
        }

        self.inflight.drain().await;

        let library = self.state.write().library.take();
        if let Some(library) = library {
            self.platform.close(library);
        }
        tracing::debug!("plugin closed");
    }

    /// True once `close()` has begun.
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Number of tracked open stream handles.
    pub fn active_stream_count(&self) -> usize {
        self.state.read().active_streams.len()
    }
}

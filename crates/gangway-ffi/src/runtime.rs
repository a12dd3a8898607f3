//! Global runtime state behind the C exports.
//!
//! The embedding host is C code: it cannot hold a tokio runtime or an Arc.
//! Everything it talks to lives in one process-wide [`FfiRuntime`]: the
//! session registry, the stream dispatcher, the async matcher, the
//! installed unary service, and the registered callback pointers.

use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use gangway_core::{
    FfiMessage, FrameKind, HostSink, Metadata, PendingRequests, Status, StreamConfig,
    StreamDispatcher, StreamRegistry, UnaryResponse,
};
use parking_lot::{Mutex, RwLock};

use crate::data::alloc_bytes;

/// Outbound stream callback: `(session_id, frame_kind, data, len)`.
/// Ownership of `data` transfers to the host.
pub type StreamCallbackFn =
    unsafe extern "C" fn(session_id: i64, frame_kind: u8, data: *mut c_void, len: i64);

/// Host unary callback: `(request_id, method, data, len)`. The host must
/// answer via `gangway_send_async_response` with the same request id; the
/// `data` buffer is only valid for the duration of the call.
pub type UnaryCallbackFn =
    unsafe extern "C" fn(request_id: i64, method: *const c_char, data: *mut c_void, len: i64);

/// Per-call context handed to the installed unary service.
#[derive(Debug, Default, Clone)]
pub struct CallOptions {
    /// Caller-supplied metadata, minus the reserved timeout key.
    pub metadata: Metadata,
}

/// The gRPC-shaped service implementation backing the unary exports.
pub trait UnaryService: Send + Sync + 'static {
    fn invoke(
        &self,
        call: CallOptions,
        method: &str,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<UnaryResponse, Status>>;
}

#[derive(Default, Clone, Copy)]
struct RegisteredCallbacks {
    copy: Option<StreamCallbackFn>,
    zero_copy: Option<StreamCallbackFn>,
}

/// [`HostSink`] over the registered C callbacks.
///
/// The copy path allocates C memory, copies the frame in, and hands the
/// allocation to the host. The zero-copy path serializes the message
/// directly into the allocation and is used for DATA frames only; metadata
/// frames always travel the copy path.
struct CallbackSink {
    callbacks: RegisteredCallbacks,
}

impl CallbackSink {
    fn deliver(cb: StreamCallbackFn, session_id: i64, kind: FrameKind, payload: &[u8]) {
        let (ptr, len) = alloc_bytes(payload);
        // SAFETY: the callback contract transfers ownership of ptr to the
        // host; null/0 is a valid empty frame.
        unsafe { cb(session_id, kind as u8, ptr, len) };
    }
}

impl HostSink for CallbackSink {
    fn send_frame(
        &self,
        session_id: i64,
        kind: FrameKind,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<(), Status>> {
        // Host callbacks run synchronously: a slow host throttles the
        // handler right here, no runtime-side buffering. The two
        // registrations share a signature, so the copy path can fall back
        // to the zero-copy pointer when only that one is registered.
        let cb = self.callbacks.copy.or(self.callbacks.zero_copy);
        if let Some(cb) = cb {
            Self::deliver(cb, session_id, kind, &payload);
        } else {
            tracing::trace!(session_id, kind = ?kind, "no stream callback registered");
        }
        Box::pin(std::future::ready(Ok(())))
    }

    fn send_data_message(
        &self,
        session_id: i64,
        message: &dyn FfiMessage,
    ) -> Option<Result<(), Status>> {
        let cb = self.callbacks.zero_copy?;
        Some(match crate::data::alloc_message(message) {
            Ok((ptr, len)) => {
                // SAFETY: ownership of ptr transfers to the host.
                unsafe { cb(session_id, FrameKind::Data as u8, ptr, len) };
                Ok(())
            }
            Err(e) => Err(e),
        })
    }
}

/// Process-wide state behind the C exports.
pub struct FfiRuntime {
    runtime: tokio::runtime::Runtime,
    registry: Arc<StreamRegistry>,
    dispatcher: Arc<StreamDispatcher>,
    matcher: Arc<PendingRequests>,
    service: RwLock<Option<Arc<dyn UnaryService>>>,
    callbacks: Mutex<RegisteredCallbacks>,
    host_unary: Mutex<Option<UnaryCallbackFn>>,
}

impl FfiRuntime {
    fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("gangway-ffi")
            .enable_all()
            .build()
            .expect("failed to build gangway runtime");
        let registry = Arc::new(StreamRegistry::new());
        let dispatcher = Arc::new(StreamDispatcher::with_runtime(
            registry.clone(),
            runtime.handle().clone(),
        ));
        Self {
            runtime,
            registry,
            dispatcher,
            matcher: Arc::new(PendingRequests::default()),
            service: RwLock::new(None),
            callbacks: Mutex::new(RegisteredCallbacks::default()),
            host_unary: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<StreamDispatcher> {
        &self.dispatcher
    }

    pub fn matcher(&self) -> &Arc<PendingRequests> {
        &self.matcher
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        self.runtime.handle()
    }

    /// Run a future to completion on the bridge runtime from a host thread.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn install_service(&self, service: Arc<dyn UnaryService>) {
        *self.service.write() = Some(service);
    }

    pub fn clear_service(&self) {
        *self.service.write() = None;
    }

    pub fn service(&self) -> Option<Arc<dyn UnaryService>> {
        self.service.read().clone()
    }

    pub fn set_stream_config(&self, config: StreamConfig) {
        self.registry.set_config(config);
    }

    pub(crate) fn set_copy_callback(&self, cb: Option<StreamCallbackFn>) {
        let mut callbacks = self.callbacks.lock();
        callbacks.copy = cb;
        self.refresh_sink(*callbacks);
    }

    pub(crate) fn set_zero_copy_callback(&self, cb: Option<StreamCallbackFn>) {
        let mut callbacks = self.callbacks.lock();
        callbacks.zero_copy = cb;
        self.refresh_sink(*callbacks);
    }

    fn refresh_sink(&self, callbacks: RegisteredCallbacks) {
        if callbacks.copy.is_none() && callbacks.zero_copy.is_none() {
            self.registry.set_host_sink(None);
        } else {
            self.registry
                .set_host_sink(Some(Arc::new(CallbackSink { callbacks })));
        }
    }

    /// Register the host unary callback. Pending requests keyed against the
    /// previous callback are released first (hot reload).
    pub(crate) fn set_host_unary_callback(&self, cb: Option<UnaryCallbackFn>) {
        self.matcher.cleanup();
        *self.host_unary.lock() = cb;
    }

    pub(crate) fn host_unary_callback(&self) -> Option<UnaryCallbackFn> {
        *self.host_unary.lock()
    }
}

/// The process-wide runtime instance, built on first use.
pub fn runtime() -> &'static FfiRuntime {
    static RUNTIME: std::sync::LazyLock<FfiRuntime> = std::sync::LazyLock::new(FfiRuntime::new);
    &RUNTIME
}

//! gangway: an in-process RPC bridge.
//!
//! One gRPC-shaped service implementation, consumed over three transports
//! by the same client code:
//!
//! - **in-process**: [`inproc::InProcChannel`] routes calls directly to the
//!   implementation object, messages crossing bounded channels as typed
//!   values with no serialization.
//! - **C ABI / FFI**: the `gangway-ffi` exports let an embedding host (a UI
//!   runtime, a test harness) drive unary and streaming calls over flat C
//!   functions and callbacks.
//! - **plugin**: [`plugin::Plugin`] loads a shared object exporting the
//!   gangway plugin surface and gives the host typed unary and streaming
//!   endpoints with safe unload.
//!
//! The session runtime underneath (registry, frames, ready handshake,
//! dispatcher, matcher) lives in [`core`].
//!
//! # Streaming model
//!
//! Every streaming RPC is a [`core::StreamSession`]: a monotonic id, a
//! bounded inbound channel, an outbound sink, and two one-shot events
//! (`ready`, `done`). A handler task drives the session and terminates it
//! with END or ERROR; the frame order HEADER → DATA… → TRAILER → END is
//! guaranteed per session.

pub use gangway_core as core;
pub use gangway_ffi as ffi;
pub use gangway_inproc as inproc;
pub use gangway_plugin as plugin;

pub use gangway_core::{
    ErrorCode, FrameKind, Metadata, Status, StreamDispatcher, StreamKind, StreamRegistry,
    StreamSession, stream_handler,
};

/// Convenient imports for service and handler code.
pub mod prelude {
    pub use gangway_core::{
        ErrorCode, Metadata, Status, StreamKind, StreamSession, UnaryResponse, stream_handler,
    };
    pub use gangway_ffi::{CallOptions, UnaryService};
    pub use gangway_inproc::{CallContext, InProcChannel, InProcService, ServerStreamPair};
    pub use gangway_plugin::{Plugin, PluginClientConn, PluginError};
}

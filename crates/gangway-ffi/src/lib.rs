//! gangway-ffi: the C ABI surface of the gangway RPC bridge.
//!
//! An embedding host (typically a UI runtime) loads this library and talks
//! to the installed service implementation through flat C exports:
//!
//! - unary: [`gangway_invoke_unary`] / [`gangway_invoke_unary_with_metadata`]
//!   returning [`FfiData`], released with [`gangway_free_data`]
//! - streaming: `gangway_open_*_stream`, [`gangway_push_stream_data`],
//!   [`gangway_close_stream_input`], [`gangway_close_stream`],
//!   [`gangway_stream_ready`], with outbound frames delivered to the
//!   callbacks registered via [`gangway_register_stream_callback`] and
//!   [`gangway_register_stream_callback_zero_copy`]
//! - host-directed calls: [`gangway_register_unary_callback`] and
//!   [`gangway_send_async_response`], driven from handler code through
//!   [`host::invoke_host`] / [`host::invoke_host_stream`]
//!
//! The Rust side installs its implementation with [`install_service`] and
//! registers stream handlers on [`dispatcher`].

#![forbid(unsafe_op_in_unsafe_fn)]

mod data;
mod exports;
pub mod host;
mod runtime;

use std::sync::Arc;

pub use data::FfiData;
pub use exports::{
    gangway_close_stream, gangway_close_stream_input, gangway_free_data,
    gangway_invoke_unary, gangway_invoke_unary_with_metadata, gangway_open_bidi_stream,
    gangway_open_client_stream, gangway_open_server_stream, gangway_push_stream_data,
    gangway_register_stream_callback, gangway_register_stream_callback_zero_copy,
    gangway_register_unary_callback, gangway_send_async_response, gangway_stream_ready,
};
pub use runtime::{
    CallOptions, FfiRuntime, StreamCallbackFn, UnaryCallbackFn, UnaryService, runtime,
};

use gangway_core::{PendingRequests, StreamConfig, StreamDispatcher, StreamRegistry};

/// Install the service implementation backing the unary exports.
pub fn install_service(service: Arc<dyn UnaryService>) {
    runtime().install_service(service);
}

/// Remove the installed service; unary calls fail with not-initialized.
pub fn clear_service() {
    runtime().clear_service();
}

/// The dispatcher stream handlers are registered on.
pub fn dispatcher() -> Arc<StreamDispatcher> {
    runtime().dispatcher().clone()
}

/// The process-wide session registry.
pub fn registry() -> Arc<StreamRegistry> {
    runtime().registry().clone()
}

/// The host-callback request matcher.
pub fn matcher() -> Arc<PendingRequests> {
    runtime().matcher().clone()
}

/// Replace the streaming configuration (readiness timeout, capacities).
pub fn set_stream_config(config: StreamConfig) {
    runtime().set_stream_config(config);
}

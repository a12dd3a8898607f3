//! gangway-core: session runtime for the gangway RPC bridge.
//!
//! This crate defines:
//! - Frame model and metadata codec ([`FrameKind`], [`Metadata`])
//! - Streaming sessions ([`StreamSession`], [`HostSink`], [`QueueSink`])
//! - The process-wide session registry ([`StreamRegistry`])
//! - Method-name dispatch of stream handlers ([`StreamDispatcher`])
//! - The host-callback request matcher ([`PendingRequests`])
//! - Status codes and error values ([`ErrorCode`], [`Status`])
//! - The C-boundary encoding facade ([`FfiMessage`], [`UnaryResponse`])
//!
//! Transport layers build on top: the FFI export surface, the in-process
//! client connection, and the plugin loader each live in their own crate.

#![forbid(unsafe_code)]

mod dispatcher;
mod error;
mod event;
mod frame;
mod matcher;
mod registry;
mod session;
mod wire;

pub use dispatcher::{
    BidiStreamFactory, ClientStreamFactory, HandlerFuture, NO_HANDLER_SESSION_ID,
    ServerStreamFactory, StreamDispatcher, StreamHandler, stream_handler,
};
pub use error::{ErrorCode, Status, StatusDetail};
pub use event::Event;
pub use frame::{FrameKind, Metadata, OutboundFrame};
pub use matcher::{DEFAULT_RESPONSE_TIMEOUT, PendingRequests, ResponseReceiver};
pub use registry::{
    FFI_INBOUND_CAPACITY, LOCAL_INBOUND_CAPACITY, StreamConfig, StreamRegistry,
};
pub use session::{HostSink, QueueSink, StreamKind, StreamSession};
pub use wire::{FfiMessage, ProtoFrame, UnaryResponse};

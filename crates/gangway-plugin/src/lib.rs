//! gangway-plugin: shared-library plugins for the gangway RPC bridge.
//!
//! A plugin is a shared object exporting the gangway C surface
//! (`Gangway_Free`, `Gangway_Invoke_<Service>`, and optionally the global
//! stream block plus `Gangway_Stream_<Service>_Open`). This crate loads it,
//! resolves and caches its symbols, and exposes three contracts:
//!
//! - unary invocation ([`Plugin::invoke`], typed via [`PluginClientConn`])
//! - streaming over opaque handles ([`PluginStream`])
//! - safe unload ([`Plugin::close`]): no call is ever executing inside the
//!   library when it is unmapped.

#![forbid(unsafe_op_in_unsafe_fn)]

mod conn;
mod error;
mod loader;
mod platform;
mod stream;

pub use conn::{PluginClientConn, PluginMessageStream};
pub use error::PluginError;
pub use loader::Plugin;
pub use platform::{DlPlatform, LibraryHandle, PluginPlatform, RawSymbol, RecvOutcome};
pub use stream::PluginStream;

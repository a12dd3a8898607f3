//! Plugin-layer errors.

use core::fmt;

/// Errors produced by the plugin loader and stream handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// OS-level load failure or a missing required symbol at load time.
    Load(String),
    /// A symbol the operation needs is not exported by the plugin.
    Symbol(String),
    /// Operation on a closed plugin.
    Closed,
    /// Operation on a closed stream handle.
    StreamClosed,
    /// Payload exceeds the 32-bit signed length the C ABI can carry.
    TooLarge,
    /// The plugin returned a 1-flagged payload: its own error message.
    Remote(String),
    /// The plugin's stream send returned a nonzero code.
    SendFailed(i32),
    /// Stream-level protocol failure (bad status, empty response).
    Stream(String),
    /// Unary invocation failure outside the plugin's own error channel.
    Invoke(String),
    /// A typed response failed to decode.
    Decode(String),
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load(msg) => write!(f, "failed to load plugin: {msg}"),
            Self::Symbol(name) => write!(f, "symbol not found: {name}"),
            Self::Closed => write!(f, "plugin is closed"),
            Self::StreamClosed => write!(f, "stream is closed"),
            Self::TooLarge => write!(f, "data too large for C interop (max 2GB)"),
            Self::Remote(msg) => write!(f, "plugin error: {msg}"),
            Self::SendFailed(code) => write!(f, "stream send failed with code {code}"),
            Self::Stream(msg) => write!(f, "stream error: {msg}"),
            Self::Invoke(msg) => write!(f, "invoke failed: {msg}"),
            Self::Decode(msg) => write!(f, "failed to decode plugin response: {msg}"),
        }
    }
}

impl std::error::Error for PluginError {}

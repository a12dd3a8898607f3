//! Typed client connection over a loaded plugin.
//!
//! Wraps the byte-level plugin surface with prost encode/decode so callers
//! work with message types. One connection is scoped to one service name;
//! the method string is the full gRPC method path.

use std::sync::Arc;

use crate::{Plugin, PluginError, PluginStream};

/// Client connection routing calls through a plugin's C ABI.
#[derive(Clone)]
pub struct PluginClientConn {
    plugin: Arc<Plugin>,
    service: String,
}

impl PluginClientConn {
    pub fn new(plugin: Arc<Plugin>, service: &str) -> Self {
        Self {
            plugin,
            service: service.to_string(),
        }
    }

    /// Unary call: encode, invoke on the blocking pool, decode.
    pub async fn unary<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, PluginError>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        let data = request.encode_to_vec();
        let plugin = self.plugin.clone();
        let service = self.service.clone();
        let method = method.to_string();

        let response = tokio::task::spawn_blocking(move || plugin.invoke(&service, &method, &data))
            .await
            .map_err(|e| PluginError::Invoke(format!("invoke task failed: {e}")))??;
        Resp::decode(response.as_slice()).map_err(|e| PluginError::Decode(e.to_string()))
    }

    /// Open a typed stream of any shape.
    pub fn open_stream(&self, method: &str) -> Result<PluginMessageStream, PluginError> {
        let stream = self.plugin.open_stream(&self.service, method)?;
        Ok(PluginMessageStream { stream })
    }
}

/// A [`PluginStream`] with prost messages at the endpoints.
pub struct PluginMessageStream {
    stream: PluginStream,
}

impl PluginMessageStream {
    pub async fn send<M: prost::Message>(&self, message: &M) -> Result<(), PluginError> {
        self.stream.send(&message.encode_to_vec()).await
    }

    /// `Ok(None)` is EOF.
    pub async fn recv<M: prost::Message + Default>(&self) -> Result<Option<M>, PluginError> {
        match self.stream.recv().await? {
            Some(bytes) => M::decode(bytes.as_slice())
                .map(Some)
                .map_err(|e| PluginError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn close_send(&self) -> Result<(), PluginError> {
        self.stream.close_send().await
    }

    pub fn close(&self) {
        self.stream.close()
    }

    pub fn inner(&self) -> &PluginStream {
        &self.stream
    }
}
